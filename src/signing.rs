use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical;
use crate::error::{CoreError, KeyFormatError, SigningError, TokenVerifyError};
use crate::jwk;
use crate::types::{Jwk, KeyPair};

pub const ES256: &str = "ES256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
}

/// Payload of a device token: the hash of the caller's data plus the key
/// that can verify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub hash: String,
    pub public_key: Jwk,
}

/// The device identity in usable form. Never `Debug`.
pub struct DeviceKey {
    sk: SigningKey,
}

impl DeviceKey {
    pub fn generate() -> Self {
        Self { sk: SigningKey::random(&mut OsRng) }
    }

    pub fn from_jwk(private_key: &Jwk) -> Result<Self, KeyFormatError> {
        Ok(Self { sk: jwk::signing_key_from_jwk(private_key)? })
    }

    pub fn public_jwk(&self) -> Jwk {
        jwk::public_jwk(self.sk.verifying_key())
    }

    pub fn key_pair(&self) -> KeyPair {
        KeyPair {
            public_key: self.public_jwk(),
            private_key: jwk::private_jwk(&self.sk),
        }
    }

    fn sign(&self, input: &[u8]) -> Result<Signature, SigningError> {
        let digest = Sha256::digest(input);
        let sig: Signature = self
            .sk
            .sign_prehash(&digest)
            .map_err(|e| SigningError::Primitive(e.to_string()))?;
        Ok(sig)
    }
}

pub struct TokenSigner;

impl TokenSigner {
    /// Mints `b64(header).b64(claims).b64(r||s)` over the canonical hash of
    /// `payload`. Works entirely offline.
    pub fn sign<T: Serialize + ?Sized>(
        payload: &T,
        private_key: &Jwk,
        public_key: &Jwk,
    ) -> Result<String, CoreError> {
        let key = DeviceKey::from_jwk(private_key)?;
        let public_key = public_key.to_public();
        if key.public_jwk() != jwk::public_jwk(&jwk::verifying_key_from_jwk(&public_key)?) {
            return Err(KeyFormatError::Mismatch.into());
        }

        let hash = canonical::sha256_hex(payload).map_err(SigningError::from)?;
        let header = TokenHeader { alg: ES256.to_string() };
        let claims = TokenClaims { hash, public_key };

        let header_json = canonical::to_canonical_string(&header).map_err(SigningError::from)?;
        let claims_json = canonical::to_canonical_string(&claims).map_err(SigningError::from)?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let sig = key.sign(signing_input.as_bytes())?;
        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig.to_bytes())))
    }
}

/// Backend-side check: the signature verifies under the embedded key and the
/// embedded hash matches `data`.
pub fn verify_token<T: Serialize + ?Sized>(token: &str, data: &T) -> Result<TokenClaims, CoreError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenVerifyError::Malformed("expected three segments".into()).into());
    };

    let header: TokenHeader = decode_segment(header_b64)?;
    if header.alg != ES256 {
        return Err(TokenVerifyError::UnsupportedAlgorithm(header.alg).into());
    }
    let claims: TokenClaims = decode_segment(claims_b64)?;
    let key = jwk::verifying_key_from_jwk(&claims.public_key)?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| TokenVerifyError::Malformed(e.to_string()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| TokenVerifyError::Malformed(e.to_string()))?;
    let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
    let digest = Sha256::digest(signing_input.as_bytes());
    key.verify_prehash(&digest, &sig)
        .map_err(|_| TokenVerifyError::BadSignature)?;

    let expected = canonical::sha256_hex(data).map_err(SigningError::from)?;
    if claims.hash != expected {
        return Err(TokenVerifyError::HashMismatch.into());
    }
    Ok(claims)
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, TokenVerifyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenVerifyError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenVerifyError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use p256::ecdsa::VerifyingKey;
    use p256::ecdsa::signature::Verifier;
    use serde_json::json;

    fn segment(token: &str, index: usize) -> Vec<u8> {
        URL_SAFE_NO_PAD.decode(token.split('.').nth(index).unwrap()).unwrap()
    }

    #[test]
    fn token_verifies_and_binds_payload_hash() {
        let keys = DeviceKey::generate().key_pair();
        let payload = json!({"phoneNumber": "+15550100", "channel": "sms"});
        let token = TokenSigner::sign(&payload, &keys.private_key, &keys.public_key).unwrap();

        assert_eq!(segment(&token, 0), br#"{"alg":"ES256"}"#.to_vec());

        let claims: TokenClaims = serde_json::from_slice(&segment(&token, 1)).unwrap();
        assert_eq!(claims.hash, canonical::sha256_hex(&payload).unwrap());
        assert_eq!(claims.public_key, keys.public_key);

        // independent ES256 check with the public key only
        let vk: VerifyingKey = jwk::verifying_key_from_jwk(&keys.public_key).unwrap();
        let (input, sig) = token.rsplit_once('.').unwrap();
        let sig = Signature::from_slice(&URL_SAFE_NO_PAD.decode(sig).unwrap()).unwrap();
        assert!(vk.verify(input.as_bytes(), &sig).is_ok());

        assert_eq!(verify_token(&token, &payload).unwrap(), claims);
    }

    #[test]
    fn private_scalar_never_leaves_in_token() {
        let keys = DeviceKey::generate().key_pair();
        // even when handed the private JWK as "public", only x/y are embedded
        let token = TokenSigner::sign(&json!(1), &keys.private_key, &keys.private_key).unwrap();
        let claims = String::from_utf8(segment(&token, 1)).unwrap();
        assert!(!claims.contains("\"d\""));
        let d = keys.private_key.d.unwrap();
        assert!(!token.contains(&d));
    }

    #[test]
    fn tampered_data_or_signature_is_rejected() {
        let keys = DeviceKey::generate().key_pair();
        let payload = json!({"amount": "100.00"});
        let token = TokenSigner::sign(&payload, &keys.private_key, &keys.public_key).unwrap();

        let err = verify_token(&token, &json!({"amount": "900.00"})).unwrap_err();
        assert!(matches!(err, CoreError::TokenVerify(TokenVerifyError::HashMismatch)));

        let other = DeviceKey::generate().key_pair();
        let forged = TokenSigner::sign(&payload, &other.private_key, &other.public_key).unwrap();
        let (_, forged_sig) = forged.rsplit_once('.').unwrap();
        let (input, _) = token.rsplit_once('.').unwrap();
        let spliced = format!("{input}.{forged_sig}");
        let err = verify_token(&spliced, &payload).unwrap_err();
        assert!(matches!(err, CoreError::TokenVerify(TokenVerifyError::BadSignature)));

        let err = verify_token("only.two", &payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenVerification);
    }

    #[test]
    fn mismatched_or_malformed_keys_fail_with_key_format() {
        let a = DeviceKey::generate().key_pair();
        let b = DeviceKey::generate().key_pair();
        let err = TokenSigner::sign(&json!({}), &a.private_key, &b.public_key).unwrap_err();
        assert!(matches!(err, CoreError::KeyFormat(KeyFormatError::Mismatch)));

        let mut broken = a.private_key.clone();
        broken.d = Some("@@@".into());
        let err = TokenSigner::sign(&json!({}), &broken, &a.public_key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyFormat);
    }
}
