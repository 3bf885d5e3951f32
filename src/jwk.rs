//! Conversions between P-256 keys and their JWK form.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};

use crate::error::KeyFormatError;
use crate::types::Jwk;

pub const KTY_EC: &str = "EC";
pub const CRV_P256: &str = "P-256";
const FIELD_LEN: usize = 32;

pub fn public_jwk(key: &VerifyingKey) -> Jwk {
    // SEC1 uncompressed: 0x04 || x || y
    let point = key.to_encoded_point(false);
    let bytes = point.as_bytes();
    Jwk {
        kty: KTY_EC.to_string(),
        crv: CRV_P256.to_string(),
        x: URL_SAFE_NO_PAD.encode(&bytes[1..1 + FIELD_LEN]),
        y: URL_SAFE_NO_PAD.encode(&bytes[1 + FIELD_LEN..]),
        d: None,
    }
}

pub fn private_jwk(key: &SigningKey) -> Jwk {
    Jwk {
        d: Some(URL_SAFE_NO_PAD.encode(key.to_bytes())),
        ..public_jwk(key.verifying_key())
    }
}

pub fn verifying_key_from_jwk(jwk: &Jwk) -> Result<VerifyingKey, KeyFormatError> {
    check_params(jwk)?;
    let x = decode_field("x", &jwk.x)?;
    let y = decode_field("y", &jwk.y)?;
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&x),
        FieldBytes::from_slice(&y),
        false,
    );
    VerifyingKey::from_encoded_point(&point).map_err(|_| KeyFormatError::InvalidPoint)
}

/// Parses the private half and checks that its `x`/`y` belong to `d`.
pub fn signing_key_from_jwk(jwk: &Jwk) -> Result<SigningKey, KeyFormatError> {
    check_params(jwk)?;
    let d = jwk.d.as_deref().ok_or(KeyFormatError::MissingPrivateScalar)?;
    let d = decode_field("d", d)?;
    let key = SigningKey::from_slice(&d).map_err(|_| KeyFormatError::InvalidScalar)?;

    let x = decode_field("x", &jwk.x)?;
    let y = decode_field("y", &jwk.y)?;
    let derived = key.verifying_key().to_encoded_point(false);
    let bytes = derived.as_bytes();
    if bytes[1..1 + FIELD_LEN] != x[..] || bytes[1 + FIELD_LEN..] != y[..] {
        return Err(KeyFormatError::Mismatch);
    }
    Ok(key)
}

fn check_params(jwk: &Jwk) -> Result<(), KeyFormatError> {
    if jwk.kty != KTY_EC {
        return Err(KeyFormatError::UnsupportedKeyType(jwk.kty.clone()));
    }
    if jwk.crv != CRV_P256 {
        return Err(KeyFormatError::UnsupportedCurve(jwk.crv.clone()));
    }
    Ok(())
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, KeyFormatError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| KeyFormatError::InvalidEncoding {
            field,
            reason: e.to_string(),
        })?;
    if bytes.len() != FIELD_LEN {
        return Err(KeyFormatError::InvalidLength {
            field,
            expected: FIELD_LEN,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}
