// First nonce from 0 whose canonical preimage hash has `difficulty` leading hex zeros.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical;
use crate::error::ProofOfWorkError;
use crate::types::ProofOfWorkSolution;

/// Hex length of a SHA-256 digest; anything above can never be satisfied.
pub const MAX_DIFFICULTY: u32 = 64;

/// Iterations between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowPuzzle {
    pub initiation_nonce: String,
    /// Canonical JSON string of the device public JWK.
    pub device_public_key: String,
    pub difficulty: u32,
}

/// The object that gets hashed. Field names are part of the wire contract.
#[derive(Serialize)]
struct PowPreimage<'a> {
    #[serde(rename = "initiationNonce")]
    initiation_nonce: &'a str,
    #[serde(rename = "devicePub")]
    device_pub: &'a str,
    #[serde(rename = "powNonce")]
    pow_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowOutcome {
    pub solution: ProofOfWorkSolution,
    pub iterations: u64,
    pub elapsed_ms: u64,
}

/// Reference hash for one candidate, via the generic canonicalizer.
pub fn pow_hash(initiation_nonce: &str, device_pub: &str, nonce: u64) -> Result<String, ProofOfWorkError> {
    let preimage = PowPreimage {
        initiation_nonce,
        device_pub,
        pow_nonce: nonce.to_string(),
    };
    canonical::sha256_hex(&preimage).map_err(|e| ProofOfWorkError::Encoding(e.to_string()))
}

pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    let d = difficulty as usize;
    hash_hex.len() >= d && hash_hex.bytes().take(d).all(|b| b == b'0')
}

/// Recomputes the hash for `solution` and checks it against the puzzle.
pub fn verify_solution(puzzle: &PowPuzzle, solution: &ProofOfWorkSolution) -> Result<bool, ProofOfWorkError> {
    let hash = pow_hash(&puzzle.initiation_nonce, &puzzle.device_public_key, solution.nonce)?;
    Ok(hash == solution.hash && meets_difficulty(&hash, puzzle.difficulty))
}

pub fn solve(puzzle: &PowPuzzle) -> Result<ProofOfWorkSolution, ProofOfWorkError> {
    let never = AtomicBool::new(false);
    solve_with_cancel(puzzle, &never).map(|out| out.solution)
}

/// Brute-force search, checking `cancel` every few thousand candidates.
pub fn solve_with_cancel(puzzle: &PowPuzzle, cancel: &AtomicBool) -> Result<PowOutcome, ProofOfWorkError> {
    if puzzle.difficulty > MAX_DIFFICULTY {
        return Err(ProofOfWorkError::UnsatisfiableDifficulty {
            difficulty: puzzle.difficulty,
            max: MAX_DIFFICULTY,
        });
    }

    // Sorted keys put powNonce last, so everything before its digits is a
    // fixed prefix and the hasher state can be reused.
    let prefix = canonical_prefix(puzzle)?;
    let base = Sha256::new_with_prefix(prefix.as_bytes());
    let t0 = Instant::now();
    let mut digits = String::with_capacity(20);
    let mut nonce: u64 = 0;

    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(ProofOfWorkError::Cancelled);
        }

        digits.clear();
        let _ = write!(digits, "{nonce}");
        let mut hasher = base.clone();
        hasher.update(digits.as_bytes());
        hasher.update(b"\"}");
        let digest = hasher.finalize();

        if leading_zero_nibbles(&digest, puzzle.difficulty) {
            return Ok(PowOutcome {
                solution: ProofOfWorkSolution {
                    nonce,
                    hash: hex::encode(digest),
                },
                iterations: nonce + 1,
                elapsed_ms: t0.elapsed().as_millis() as u64,
            });
        }
        nonce = nonce
            .checked_add(1)
            .ok_or_else(|| ProofOfWorkError::WorkerFailed("nonce space exhausted".into()))?;
    }
}

fn canonical_prefix(puzzle: &PowPuzzle) -> Result<String, ProofOfWorkError> {
    let encode = |s: &str| serde_json::to_string(s).map_err(|e| ProofOfWorkError::Encoding(e.to_string()));
    Ok(format!(
        "{{\"devicePub\":{},\"initiationNonce\":{},\"powNonce\":\"",
        encode(&puzzle.device_public_key)?,
        encode(&puzzle.initiation_nonce)?
    ))
}

fn leading_zero_nibbles(digest: &[u8], difficulty: u32) -> bool {
    let d = difficulty as usize;
    let full = d / 2;
    if digest[..full].iter().any(|&b| b != 0) {
        return false;
    }
    d % 2 == 0 || digest[full] >> 4 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn puzzle(difficulty: u32) -> PowPuzzle {
        PowPuzzle {
            initiation_nonce: "abc123".into(),
            device_public_key: r#"{"crv":"P-256","kty":"EC","x":"f83O","y":"x_FE"}"#.into(),
            difficulty,
        }
    }

    #[test]
    fn solutions_meet_difficulty_and_rehash() {
        for difficulty in 0..=3 {
            let p = puzzle(difficulty);
            let sol = solve(&p).unwrap();
            assert!(sol.hash.starts_with(&"0".repeat(difficulty as usize)));
            assert_eq!(
                pow_hash(&p.initiation_nonce, &p.device_public_key, sol.nonce).unwrap(),
                sol.hash
            );
            assert!(verify_solution(&p, &sol).unwrap());
        }
    }

    #[test]
    fn solution_is_the_first_satisfying_nonce() {
        let p = puzzle(2);
        let sol = solve(&p).unwrap();
        for n in 0..sol.nonce {
            let h = pow_hash(&p.initiation_nonce, &p.device_public_key, n).unwrap();
            assert!(!meets_difficulty(&h, 2), "nonce {n} already satisfied");
        }
    }

    #[test]
    fn difficulty_zero_returns_first_nonce() {
        let never = AtomicBool::new(false);
        let out = solve_with_cancel(&puzzle(0), &never).unwrap();
        assert_eq!(out.solution.nonce, 0);
        assert_eq!(out.iterations, 1);
    }

    #[test]
    fn fast_path_matches_canonical_hash() {
        let p = PowPuzzle {
            initiation_nonce: "with \"quotes\" and \\".into(),
            device_public_key: "{\"kty\":\"EC\"}".into(),
            difficulty: 1,
        };
        let sol = solve(&p).unwrap();
        assert_eq!(
            pow_hash(&p.initiation_nonce, &p.device_public_key, sol.nonce).unwrap(),
            sol.hash
        );
    }

    #[test]
    fn wrong_solutions_do_not_verify() {
        let p = puzzle(2);
        let sol = solve(&p).unwrap();
        let wrong_hash = ProofOfWorkSolution {
            nonce: sol.nonce,
            hash: "00".repeat(32),
        };
        assert!(!verify_solution(&p, &wrong_hash).unwrap());

        let other_device = PowPuzzle {
            device_public_key: "{}".into(),
            ..p
        };
        assert!(!verify_solution(&other_device, &sol).unwrap());
    }

    #[test]
    fn rejects_unsatisfiable_difficulty() {
        assert_eq!(
            solve(&puzzle(65)),
            Err(ProofOfWorkError::UnsatisfiableDifficulty { difficulty: 65, max: 64 })
        );
    }

    #[test]
    fn honours_cancellation() {
        let cancelled = AtomicBool::new(true);
        assert_eq!(
            solve_with_cancel(&puzzle(64), &cancelled),
            Err(ProofOfWorkError::Cancelled)
        );
    }

    #[test]
    fn nibble_check_handles_odd_difficulty() {
        assert!(leading_zero_nibbles(&[0x00, 0x0f, 0xff], 3));
        assert!(!leading_zero_nibbles(&[0x00, 0x10, 0xff], 3));
        assert!(leading_zero_nibbles(&[0xff], 0));
        assert!(meets_difficulty("000abc", 3));
        assert!(!meets_difficulty("00", 3));
    }
}
