// Object keys sorted at every level, no whitespace, numbers in ECMAScript form.
// Sorting is done here so serde_json's `preserve_order` cannot change it.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 of the canonical encoding of `value`.
pub fn sha256_hex<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = to_canonical_string(value)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn write_value(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) => out.push_str(&format_f64(f)),
            None => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Formats a finite double the way `Number.prototype.toString` does, so
/// `100.0` hashes as `100` and `1e21` as `1e+21`.
fn format_f64(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    let sign = if f < 0.0 { "-" } else { "" };

    // shortest round-trip digits, e.g. "1.25e1"
    let sci = format!("{:e}", f.abs());
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exp + 1;

    let body = if k <= n && n <= 21 {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        format!("{}.{}", &digits[..n as usize], &digits[n as usize..])
    } else if -6 < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let e = n - 1;
        let e_sign = if e < 0 { '-' } else { '+' };
        if k == 1 {
            format!("{}e{}{}", digits, e_sign, e.abs())
        } else {
            format!("{}.{}e{}{}", &digits[..1], &digits[1..], e_sign, e.abs())
        }
    };
    format!("{sign}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively_without_whitespace() {
        let value = json!({
            "phone": "+15550100",
            "amount": { "value": 12.5, "currency": "USD" },
            "tags": [ { "z": 1, "a": 2 }, "b" ]
        });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"amount":{"currency":"USD","value":12.5},"phone":"+15550100","tags":[{"a":2,"z":1},"b"]}"#
        );
    }

    #[test]
    fn struct_field_order_does_not_matter() {
        #[derive(Serialize)]
        struct Forward {
            a: u8,
            b: &'static str,
        }
        #[derive(Serialize)]
        struct Reverse {
            b: &'static str,
            a: u8,
        }
        let forward = to_canonical_string(&Forward { a: 1, b: "x" }).unwrap();
        let reverse = to_canonical_string(&Reverse { b: "x", a: 1 }).unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn escapes_strings_like_json() {
        assert_eq!(
            to_canonical_string(&json!({"k": "quote\" and \\ slash"})).unwrap(),
            r#"{"k":"quote\" and \\ slash"}"#
        );
        assert_eq!(to_canonical_string("plain").unwrap(), r#""plain""#);
        assert_eq!(to_canonical_string(&json!(null)).unwrap(), "null");
    }

    #[test]
    fn floats_use_ecmascript_number_form() {
        assert_eq!(to_canonical_string(&json!({"amount": 100.0})).unwrap(), r#"{"amount":100}"#);
        assert_eq!(
            sha256_hex(&json!({"amount": 100.0})).unwrap(),
            sha256_hex(&json!({"amount": 100})).unwrap()
        );
        assert_eq!(to_canonical_string(&json!(1e21)).unwrap(), "1e+21");
        assert_eq!(to_canonical_string(&json!(-0.0)).unwrap(), "0");
        assert_eq!(to_canonical_string(&json!(12.5)).unwrap(), "12.5");
        assert_eq!(to_canonical_string(&json!(-1.5)).unwrap(), "-1.5");
        assert_eq!(to_canonical_string(&json!(1e20)).unwrap(), "100000000000000000000");
        assert_eq!(to_canonical_string(&json!(0.000001)).unwrap(), "0.000001");
        assert_eq!(to_canonical_string(&json!(1e-7)).unwrap(), "1e-7");
        assert_eq!(to_canonical_string(&json!(1.5e-7)).unwrap(), "1.5e-7");
        assert_eq!(to_canonical_string(&json!(0.1)).unwrap(), "0.1");
        assert_eq!(to_canonical_string(&json!(123.456)).unwrap(), "123.456");
    }

    #[test]
    fn hash_covers_the_canonical_form() {
        let value = json!({"b": [1, 2], "a": true});
        let expected = hex::encode(Sha256::digest(br#"{"a":true,"b":[1,2]}"#));
        assert_eq!(sha256_hex(&value).unwrap(), expected);
        assert_eq!(sha256_hex(&json!({})).unwrap(), hex::encode(Sha256::digest(b"{}")));
    }
}
