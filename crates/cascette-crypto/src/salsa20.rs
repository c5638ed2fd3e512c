//! Salsa20/20 with 128-bit keys
//!
//! Armadillo-protected CDN files use plain Salsa20 with a 16-byte key
//! ("expand 16-byte k" constants) and an 8-byte nonce taken from the file's
//! own key. The block counter starts at zero.

use crate::error::CryptoError;

/// Nonce length in bytes
pub const NONCE_SIZE: usize = 8;

/// Salsa20 keystream generator
pub struct Salsa20Cipher {
    state: [u32; 16],
    keystream: [u8; 64],
    keystream_pos: usize,
}

impl Salsa20Cipher {
    /// Create a cipher for a 16-byte key and an 8-byte nonce
    pub fn new(key: &[u8; 16], nonce: &[u8]) -> Result<Self, CryptoError> {
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidIvSize {
                expected: NONCE_SIZE,
                actual: nonce.len(),
            });
        }

        let word = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let mut state = [0u32; 16];

        // "expand 16-byte k"
        state[0] = 0x6170_7865;
        state[5] = 0x3120_646e;
        state[10] = 0x7962_2d36;
        state[15] = 0x6b20_6574;

        for i in 0..4 {
            let k = word(&key[i * 4..]);
            state[1 + i] = k;
            state[11 + i] = k;
        }

        state[6] = word(&nonce[0..4]);
        state[7] = word(&nonce[4..8]);

        Ok(Self {
            state,
            keystream: [0; 64],
            keystream_pos: 64,
        })
    }

    fn generate_keystream(&mut self) {
        let mut working = self.state;

        for _ in 0..10 {
            // Column round
            Self::quarter_round(&mut working, 0, 4, 8, 12);
            Self::quarter_round(&mut working, 5, 9, 13, 1);
            Self::quarter_round(&mut working, 10, 14, 2, 6);
            Self::quarter_round(&mut working, 15, 3, 7, 11);

            // Row round
            Self::quarter_round(&mut working, 0, 1, 2, 3);
            Self::quarter_round(&mut working, 5, 6, 7, 4);
            Self::quarter_round(&mut working, 10, 11, 8, 9);
            Self::quarter_round(&mut working, 15, 12, 13, 14);
        }

        for (i, (out, initial)) in working.iter().zip(self.state.iter()).enumerate() {
            let bytes = out.wrapping_add(*initial).to_le_bytes();
            self.keystream[i * 4..(i + 1) * 4].copy_from_slice(&bytes);
        }

        self.state[8] = self.state[8].wrapping_add(1);
        if self.state[8] == 0 {
            self.state[9] = self.state[9].wrapping_add(1);
        }

        self.keystream_pos = 0;
    }

    fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
        state[b] ^= state[a].wrapping_add(state[d]).rotate_left(7);
        state[c] ^= state[b].wrapping_add(state[a]).rotate_left(9);
        state[d] ^= state[c].wrapping_add(state[b]).rotate_left(13);
        state[a] ^= state[d].wrapping_add(state[c]).rotate_left(18);
    }

    /// XOR the keystream into `data` in place
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.keystream_pos >= 64 {
                self.generate_keystream();
            }
            *byte ^= self.keystream[self.keystream_pos];
            self.keystream_pos += 1;
        }
    }
}

/// Decrypt (or encrypt) a buffer
pub fn apply_salsa20(data: &[u8], key: &[u8; 16], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut cipher = Salsa20Cipher::new(key, nonce)?;
    let mut output = data.to_vec();
    cipher.apply_keystream(&mut output);
    Ok(output)
}
