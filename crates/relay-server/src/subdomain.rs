use rand::Rng;

use crate::registry::TunnelRegistry;

pub const LABEL_LEN: usize = 12;
const MAX_ATTEMPTS: usize = 5;

/// Random lowercase-alphanumeric label. ThreadRng is a CSPRNG, which keeps
/// the single-shot collision probability negligible at the target tunnel
/// count (36^12 label space).
fn random_label() -> String {
    let mut rng = rand::rng();
    (0..LABEL_LEN)
        .map(|_| {
            let idx = rng.random_range(0..36u32);
            if idx < 10 {
                (b'0' + idx as u8) as char
            } else {
                (b'a' + (idx - 10) as u8) as char
            }
        })
        .collect()
}

/// Generate a label not currently present in the registry. Returns None when
/// the retries are exhausted; the caller closes with try-again-later.
pub fn generate(registry: &TunnelRegistry) -> Option<String> {
    for _ in 0..MAX_ATTEMPTS {
        let label = random_label();
        if !registry.has(&label) {
            return Some(label);
        }
    }
    None
}
