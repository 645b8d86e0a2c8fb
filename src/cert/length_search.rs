//! Length-targeted root CA generation.
//!
//! Produces a self-signed root certificate whose DER encoding is exactly
//! `target_len` bytes, by padding the Organizational Unit subject field one
//! character at a time. DER length is not a free parameter of X.509, but it
//! is monotonic in the length of a subject string: each appended character
//! grows the encoding by (almost always) exactly one byte, so a baseline
//! template that is not already too large will eventually cross any
//! reachable target.

use rsa::RsaPrivateKey;

use super::{generate_root_ca, CertTemplate, KeyPair};
use crate::error::{CastforgeError, Result};

const MAX_OUTER_ATTEMPTS: usize = 10;
/// Safety cap on the inner OU-padding loop. A single-character append moves
/// the DER length by roughly one byte, so a few thousand iterations is far
/// more than any real certificate should ever need; if this is hit the
/// inner loop gives up and asks the outer loop to retry with a fresh key.
const MAX_INNER_ITERATIONS: usize = 4096;

/// `GenerateReplacementRootCA(existing_der_len, template?, key?) -> KeyPair`.
///
/// Outer loop, up to [`MAX_OUTER_ATTEMPTS`]:
/// 1. Reset OU to the template's baseline value.
/// 2. Use the caller-supplied key only on the very first outer attempt;
///    every retry generates a fresh RSA-2048 key, since certain moduli
///    yield DER lengths that single-character OU padding can never reach.
/// 3. Inner loop: issue a root cert, measure its DER length.
///    - On the first issuance of this outer attempt, an oversized result is
///      fatal for the whole operation: the baseline template is already too
///      large and no amount of padding can shrink it.
///    - An exact match returns immediately.
///    - An undersized result appends one `'x'` to OU and tries again.
///    - An oversized result past the first issuance means this key's
///      trajectory skipped over the target; abandon it and retry the outer
///      loop with a fresh key.
pub fn generate_replacement_root_ca(
    target_len: usize,
    template: Option<CertTemplate>,
    key: Option<RsaPrivateKey>,
) -> Result<KeyPair> {
    let base_template = template.unwrap_or_else(|| CertTemplate::default_ca("Cast Root CA"));
    let baseline_ou = base_template.organizational_unit.clone();

    let mut given_key = key;

    for outer_attempt in 0..MAX_OUTER_ATTEMPTS {
        let mut template = base_template.clone();
        template.organizational_unit = baseline_ou.clone();

        // Only the first outer attempt may use a caller-supplied key; every
        // retry after that needs a fresh modulus to change trajectory.
        let mut key_for_inner = if outer_attempt == 0 {
            given_key.take()
        } else {
            None
        };
        let mut first_issuance = true;

        for _ in 0..MAX_INNER_ITERATIONS {
            let candidate = generate_root_ca(Some(template.clone()), key_for_inner.take())?;
            let len = candidate.cert_der.len();

            if first_issuance && len > target_len {
                return Err(CastforgeError::SearchExhausted(
                    "generated greater than target on first try".to_string(),
                ));
            }
            if len == target_len {
                return Ok(candidate);
            }
            if len > target_len {
                // Past the first issuance: this trajectory overshot without
                // ever landing exactly. Abandon it for a fresh outer attempt.
                break;
            }

            // len < target_len: keep the key, pad OU, try again.
            key_for_inner = Some(candidate.private_key);
            template.organizational_unit.push('x');
            first_issuance = false;
        }
    }

    Err(CastforgeError::SearchExhausted(format!(
        "exhausted {MAX_OUTER_ATTEMPTS} outer attempts without reaching target length {target_len}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_hit_from_baseline_plus_seven() {
        let baseline = generate_root_ca(None, None).unwrap();
        let target = baseline.cert_der.len() + 7;

        let result = generate_replacement_root_ca(target, None, None).unwrap();
        assert_eq!(result.cert_der.len(), target);
    }

    #[test]
    fn overshoot_on_first_issuance_fails() {
        let baseline = generate_root_ca(None, None).unwrap();
        // A target shorter than the baseline's own first issuance forces an
        // immediate overshoot.
        let target = baseline.cert_der.len().saturating_sub(50);

        let result = generate_replacement_root_ca(target, None, None);
        assert!(matches!(result, Err(CastforgeError::SearchExhausted(_))));
    }

    #[test]
    fn unreachable_small_target_exhausts() {
        let result = generate_replacement_root_ca(10, None, None);
        assert!(result.is_err());
    }
}
