//! SRT payload encryption: passphrase based key wrapping and AES-CTR.

use std::num::NonZeroU32;

use aes::cipher::consts::U16;
use aes::cipher::{BlockEncrypt, BlockSizeUser, KeyInit};
use aes::{Aes128, Aes192, Aes256, Block};
use bytes::{BufMut, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::TransportError;
use crate::TransportResult;

/// Salt length used in the key material message.
pub const SALT_LEN: usize = 16;

/// Allowed passphrase length.
pub const PASSPHRASE_LEN: std::ops::RangeInclusive<usize> = 10..=79;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(2048) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

const KEY_WRAP_IV: u64 = 0xA6A6_A6A6_A6A6_A6A6;

/// Key material of one encrypted session: the stream key and its salt.
#[derive(Clone)]
pub struct KeyMaterial {
    salt: [u8; SALT_LEN],
    key: Vec<u8>,
    kek: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Draw a fresh salt and stream key and derive the wrapping key from
    /// `passphrase`.
    pub fn generate(passphrase: &str, key_len: usize) -> TransportResult<Self> {
        if !PASSPHRASE_LEN.contains(&passphrase.len()) {
            return Err(TransportError::ConnectionFailed(format!(
                "SRT passphrase must be {} to {} characters",
                PASSPHRASE_LEN.start(),
                PASSPHRASE_LEN.end()
            )));
        }

        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        let mut key = vec![0u8; key_len];
        rng.fill(&mut salt)
            .and_then(|_| rng.fill(&mut key))
            .map_err(|_| TransportError::Protocol("no secure random source".to_string()))?;

        Ok(Self::with_parts(passphrase, salt, key))
    }

    fn with_parts(passphrase: &str, salt: [u8; SALT_LEN], key: Vec<u8>) -> Self {
        let mut kek = vec![0u8; key.len()];
        pbkdf2_sha1(passphrase.as_bytes(), &salt[SALT_LEN - 8..], &mut kek);
        Self { salt, key, kek }
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    /// KMREQ body announcing the even key.
    pub fn message(&self) -> TransportResult<Bytes> {
        let wrapped = wrap_key(&self.kek, &self.key)?;
        let mut buf = BytesMut::with_capacity(16 + SALT_LEN + wrapped.len());
        // Version 1, packet type KMmsg, signature "HAI", even key.
        buf.put_slice(&[0x12, 0x20, 0x29, 0x01]);
        buf.put_u32(0);
        // AES-CTR, no auth, MPEG-TS over SRT.
        buf.put_slice(&[2, 0, 2, 0]);
        buf.put_u16(0);
        buf.put_u8((SALT_LEN / 4) as u8);
        buf.put_u8((self.key.len() / 4) as u8);
        buf.put_slice(&self.salt);
        buf.put_slice(&wrapped);
        Ok(buf.freeze())
    }

    /// Encrypt `payload` of the packet with sequence number `seq` in place.
    pub fn encrypt(&self, seq: u32, payload: &mut [u8]) -> TransportResult<()> {
        let iv = self.iv(seq);
        let result = match self.key.len() {
            16 => ctr::Ctr128BE::<Aes128>::new_from_slices(&self.key, &iv)
                .map(|mut c| c.apply_keystream(payload)),
            24 => ctr::Ctr128BE::<Aes192>::new_from_slices(&self.key, &iv)
                .map(|mut c| c.apply_keystream(payload)),
            _ => ctr::Ctr128BE::<Aes256>::new_from_slices(&self.key, &iv)
                .map(|mut c| c.apply_keystream(payload)),
        };
        result.map_err(|_| TransportError::Protocol("invalid SRT key length".to_string()))
    }

    /// Counter block: salt with the packet index mixed into bytes 10..14.
    fn iv(&self, seq: u32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..14].copy_from_slice(&self.salt[..14]);
        for (byte, s) in iv[10..14].iter_mut().zip(seq.to_be_bytes()) {
            *byte ^= s;
        }
        iv
    }
}

fn pbkdf2_sha1(secret: &[u8], salt: &[u8], out: &mut [u8]) {
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA1,
        PBKDF2_ITERATIONS,
        salt,
        secret,
        out,
    );
}

/// AES key wrap (RFC 3394).
pub fn wrap_key(kek: &[u8], key: &[u8]) -> TransportResult<Vec<u8>> {
    let invalid = |_| TransportError::Protocol("invalid key wrapping key".to_string());
    match kek.len() {
        16 => Ok(wrap_with(&Aes128::new_from_slice(kek).map_err(invalid)?, key)),
        24 => Ok(wrap_with(&Aes192::new_from_slice(kek).map_err(invalid)?, key)),
        32 => Ok(wrap_with(&Aes256::new_from_slice(kek).map_err(invalid)?, key)),
        n => Err(TransportError::Protocol(format!(
            "key wrapping key of {} bytes",
            n
        ))),
    }
}

fn wrap_with<C: BlockEncrypt + BlockSizeUser<BlockSize = U16>>(cipher: &C, key: &[u8]) -> Vec<u8> {
    let mut r: Vec<[u8; 8]> = key
        .chunks(8)
        .map(|c| {
            let mut block = [0u8; 8];
            block[..c.len()].copy_from_slice(c);
            block
        })
        .collect();
    let n = r.len() as u64;
    let mut a = KEY_WRAP_IV;

    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = Block::default();
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(ri);
            cipher.encrypt_block(&mut block);

            let t = n * j + i as u64 + 1;
            let mut msb = [0u8; 8];
            msb.copy_from_slice(&block[..8]);
            a = u64::from_be_bytes(msb) ^ t;
            ri.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&a.to_be_bytes());
    for block in &r {
        out.extend_from_slice(block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{:02X}", b)).collect()
    }

    #[test]
    fn test_key_wrap_rfc3394() {
        let kek: Vec<u8> = (0u8..16).collect();
        let key = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let wrapped = wrap_key(&kek, &key).unwrap();
        assert_eq!(hex(&wrapped), "1FA68B0A8112B447AEF34BD8FB5A7B829D3E862371D2CFE5");
    }

    #[test]
    fn test_key_wrap_rejects_odd_kek() {
        assert!(wrap_key(&[0u8; 20], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_pbkdf2_sha1_rfc6070() {
        let mut out = [0u8; 20];
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA1,
            NonZeroU32::new(2).unwrap(),
            b"salt",
            b"password",
            &mut out,
        );
        assert_eq!(hex(&out), "EA6C014DC72D6F8CCD1ED92ACE1D41F0D8DE8957");
    }

    #[test]
    fn test_passphrase_length() {
        assert!(KeyMaterial::generate("short", 16).is_err());
        assert!(KeyMaterial::generate(&"x".repeat(80), 16).is_err());
        assert_eq!(KeyMaterial::generate("0123456789", 32).unwrap().key_len(), 32);
    }

    #[test]
    fn test_message_layout() {
        let km = KeyMaterial::with_parts("0123456789", [7u8; SALT_LEN], vec![1u8; 24]);
        let message = km.message().unwrap();

        assert_eq!(message.len(), 16 + 16 + 32);
        assert_eq!(&message[..4], &[0x12, 0x20, 0x29, 0x01]);
        assert_eq!(&message[8..12], &[2, 0, 2, 0]);
        assert_eq!(&message[14..16], &[4, 6]);
        assert_eq!(&message[16..32], &[7u8; 16]);
    }

    #[test]
    fn test_iv_mixes_sequence() {
        let km = KeyMaterial::with_parts("0123456789", [0xFF; SALT_LEN], vec![0u8; 16]);
        let iv = km.iv(0x0102_0304);
        assert_eq!(&iv[..10], &[0xFF; 10]);
        assert_eq!(&iv[10..14], &[0xFE, 0xFD, 0xFC, 0xFB]);
        assert_eq!(&iv[14..], &[0, 0]);
    }

    #[test]
    fn test_encrypt_changes_payload_per_packet() {
        let km = KeyMaterial::with_parts("0123456789", [3u8; SALT_LEN], vec![9u8; 16]);
        let mut first = [0x47u8; 188];
        let mut second = [0x47u8; 188];
        km.encrypt(1, &mut first).unwrap();
        km.encrypt(2, &mut second).unwrap();
        assert_ne!(first, second);

        km.encrypt(1, &mut first).unwrap();
        assert_eq!(first, [0x47u8; 188]);
    }
}
