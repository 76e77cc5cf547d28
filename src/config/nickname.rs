//! Anonymous login nicknames.
//!
//! The server accepts any `justinfan<digits>` nickname without a password
//! as a read-only guest.

use rand::RngExt;

const ANONYMOUS_PREFIX: &str = "justinfan";

/// Generate a guest nickname like `justinfan41234`.
pub fn anonymous_nickname() -> String {
    let mut rng = rand::rng();
    let num: u32 = rng.random_range(1000..81000);
    format!("{}{}", ANONYMOUS_PREFIX, num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_has_prefix_and_number_in_range() {
        for _ in 0..50 {
            let nick = anonymous_nickname();
            let num: u32 = nick.strip_prefix(ANONYMOUS_PREFIX).unwrap().parse().unwrap();
            assert!((1000..81000).contains(&num));
        }
    }
}
