//! Packet identifier generation.
//!
//! Ids double as the radio packet id and the transmit queue's correlation
//! key, so they are drawn from a CSPRNG and scaled into `[1, 10^9)` — zero is
//! reserved to mean "no id" elsewhere in the wire schema.

use rand::RngCore;

use crate::error::{CoreError, CoreResult};

const ID_CEILING: u32 = 1_000_000_000;

/// Generate a fresh packet id in `[1, 10^9)`.
///
/// Uses the OS CSPRNG (`rand::rngs::OsRng` via `rand::thread_rng`). A zero
/// draw is resampled; persistent failure to source randomness surfaces as
/// [`CoreError::RandomnessUnavailable`] rather than looping forever.
pub fn generate_packet_id() -> CoreResult<u32> {
    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let candidate = rng.next_u32() % ID_CEILING;
        if candidate != 0 {
            return Ok(candidate);
        }
    }
    Err(CoreError::RandomnessUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_in_range_and_nonzero() {
        for _ in 0..1000 {
            let id = generate_packet_id().unwrap();
            assert!(id > 0 && id < ID_CEILING);
        }
    }
}
