//! RC4 stream cipher state (spec §4.3). Hand-implemented: no crate in this
//! corpus offers the persistent two-index/S-box shape a session needs to keep
//! alive for its whole lifetime, and the teacher never wires its
//! `use_encryption` field to anything.

/// Persistent key-scheduled state for one direction of one session.
#[derive(Clone)]
pub struct Rc4KeyState {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4KeyState {
    /// Runs the key scheduling algorithm over `key`. Panics on an empty key,
    /// which is a caller bug, not a runtime condition.
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty(), "RC4 key must not be empty");

        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        Rc4KeyState { s, i: 0, j: 0 }
    }

    /// XORs the keystream into `data` in place, advancing the shared state.
    /// Calling this repeatedly with split buffers is equivalent to calling it
    /// once with the concatenation.
    pub fn transform(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

/// Encrypts `data` in place and applies the leading-zero-byte stuffing rule:
/// if the ciphertext's first byte is `0x00`, an extra `0x00` is prepended so
/// the receiver can tell a stuffed zero from a framing boundary.
pub fn encrypt_in_place(state: &mut Rc4KeyState, data: &mut Vec<u8>) {
    state.transform(data);
    if data.first() == Some(&0) {
        data.insert(0, 0);
    }
}

/// Reverses [`encrypt_in_place`]: strips one leading stuffed zero if present,
/// then decrypts in place.
pub fn decrypt_in_place(state: &mut Rc4KeyState, data: &mut Vec<u8>) {
    if data.first() == Some(&0) {
        data.remove(0);
    }
    state.transform(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rc4(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut state = Rc4KeyState::new(key);
        let mut data = plaintext.to_vec();
        state.transform(&mut data);
        data
    }

    #[test]
    fn known_answer_key() {
        assert_eq!(
            rc4(b"Key", b"Plaintext"),
            vec![0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]
        );
    }

    #[test]
    fn known_answer_wiki() {
        assert_eq!(rc4(b"Wiki", b"pedia"), vec![0x10, 0x21, 0xBF, 0x04, 0x20]);
    }

    #[test]
    fn known_answer_secret() {
        assert_eq!(
            rc4(b"Secret", b"Attack at dawn"),
            vec![
                0x45, 0xA0, 0x1F, 0x64, 0x5F, 0xC3, 0x5B, 0x38, 0x35, 0x52, 0x54, 0x4B, 0x9B, 0xF5
            ]
        );
    }

    #[test]
    fn split_calls_share_state_with_one_call() {
        let mut whole = Rc4KeyState::new(b"Secret");
        let mut whole_data = b"Attack at dawn".to_vec();
        whole.transform(&mut whole_data);

        let mut split = Rc4KeyState::new(b"Secret");
        let mut first = b"Attack ".to_vec();
        let mut second = b"at dawn".to_vec();
        split.transform(&mut first);
        split.transform(&mut second);
        let mut combined = first;
        combined.extend_from_slice(&second);

        assert_eq!(whole_data, combined);
    }

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        let mut enc_state = Rc4KeyState::new(b"session-key");
        let mut dec_state = Rc4KeyState::new(b"session-key");
        let mut data = b"hello from the output channel".to_vec();
        encrypt_in_place(&mut enc_state, &mut data);
        decrypt_in_place(&mut dec_state, &mut data);
        assert_eq!(data, b"hello from the output channel");
    }

    #[test]
    fn leading_zero_ciphertext_gets_stuffed_and_unstuffed() {
        // Search for a plaintext whose ciphertext under this key starts with 0x00.
        let key = b"stuff-test";
        let mut found = None;
        for candidate in 0u8..=255 {
            let mut state = Rc4KeyState::new(key);
            let mut data = vec![candidate];
            state.transform(&mut data);
            if data[0] == 0 {
                found = Some(candidate);
                break;
            }
        }
        let Some(candidate) = found else {
            // No single-byte plaintext produced a leading zero under this key;
            // the stuffing path is still exercised by round_trips_through_encrypt_decrypt.
            return;
        };

        let mut enc_state = Rc4KeyState::new(key);
        let mut data = vec![candidate];
        encrypt_in_place(&mut enc_state, &mut data);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], 0);

        let mut dec_state = Rc4KeyState::new(key);
        decrypt_in_place(&mut dec_state, &mut data);
        assert_eq!(data, vec![candidate]);
    }
}
