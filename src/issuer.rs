//! PIN and nonce generation.
//!
//! Collision handling against live requests belongs to the store; issuing is pure.

use alloy_primitives::B256;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

pub const PIN_DIGITS: usize = 6;
const PIN_SPACE: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issued {
    pub pin: String,
    pub nonce: B256,
}

pub trait Issuer: Send + Sync + 'static {
    fn issue(&self) -> Issued;
}

/// Uniform 6-digit PINs and 256-bit nonces from the operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIssuer;

impl Issuer for RandomIssuer {
    fn issue(&self) -> Issued {
        let mut rng = OsRng;
        let pin = format!("{:0width$}", rng.gen_range(0..PIN_SPACE), width = PIN_DIGITS);
        let mut nonce = [0u8; 32];
        rng.fill_bytes(&mut nonce);
        Issued {
            pin,
            nonce: B256::from(nonce),
        }
    }
}

pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == PIN_DIGITS && pin.bytes().all(|b| b.is_ascii_digit())
}
