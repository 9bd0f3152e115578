//! NUID generation: 22-character base62 tokens, 12 random prefix characters
//! plus a 10-character sequence advanced by a random step. The prefix comes
//! from the OS CSPRNG and is regenerated when the sequence space rolls over,
//! so concurrent clients cannot collide on chunk subjects.
use std::sync::{Mutex, OnceLock};

use rand::{Rng, RngCore};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
// 62^10, the sequence space.
const MAX_SEQ: u64 = 839_299_365_868_340_224;
const MIN_INCREMENT: u64 = 33;
const MAX_INCREMENT: u64 = 333;

pub(crate) struct Nuid {
    prefix: [u8; PREFIX_LEN],
    sequence: u64,
    increment: u64,
}

impl Nuid {
    pub(crate) fn new() -> Self {
        let mut nuid = Self {
            prefix: [0; PREFIX_LEN],
            sequence: 0,
            increment: 0,
        };
        nuid.reseed();
        nuid
    }

    fn reseed(&mut self) {
        let mut rng = rand::rngs::OsRng;
        let mut entropy = [0u8; PREFIX_LEN];
        rng.fill_bytes(&mut entropy);
        for (slot, byte) in self.prefix.iter_mut().zip(entropy) {
            *slot = ALPHABET[(byte as usize) % ALPHABET.len()];
        }
        self.sequence = rng.gen_range(0..MAX_SEQ / 2);
        self.increment = rng.gen_range(MIN_INCREMENT..=MAX_INCREMENT);
    }

    pub(crate) fn next(&mut self) -> String {
        self.sequence += self.increment;
        if self.sequence >= MAX_SEQ {
            self.reseed();
        }
        let mut token = Vec::with_capacity(PREFIX_LEN + SEQ_LEN);
        token.extend_from_slice(&self.prefix);
        let mut digits = [b'0'; SEQ_LEN];
        let mut remainder = self.sequence;
        for slot in digits.iter_mut().rev() {
            *slot = ALPHABET[(remainder % BASE) as usize];
            remainder /= BASE;
        }
        token.extend_from_slice(&digits);
        String::from_utf8(token).expect("base62 tokens are ascii")
    }
}

/// Process-global generator, shared so tokens stay unique across stores.
pub(crate) fn next_nuid() -> String {
    static GENERATOR: OnceLock<Mutex<Nuid>> = OnceLock::new();
    GENERATOR
        .get_or_init(|| Mutex::new(Nuid::new()))
        .lock()
        .unwrap()
        .next()
}
