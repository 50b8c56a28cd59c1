//! Stream encryption for backups: AES-256-CBC with a prepended IV.
//!
//! The passphrase is hashed (SHA-256) into the key. Plaintext is processed
//! in fixed 1 MiB blocks with the CBC chain running across them; PKCS7
//! padding is applied once, at finalization. The decryptor withholds the
//! final cipher block until end-of-stream so it can strip the padding.

use std::pin::Pin;
use std::task::{Context, Poll};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cachegrid_core::{CIPHER_BLOCK_SIZE, CIPHER_IV_LEN};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Cipher block width (AES).
const BLOCK: usize = 16;

/// Errors from the decrypting transform.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext ends mid-block; stream is truncated")]
    Truncated,
    #[error("bad padding: wrong passphrase or corrupt stream")]
    BadPadding,
}

/// Derives the 32-byte cipher key from a passphrase.
#[must_use]
pub fn derive_key(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// A fresh random IV.
#[must_use]
pub fn random_iv() -> [u8; CIPHER_IV_LEN] {
    rand::random()
}

/// Incremental AES-256-CBC encryptor.
pub struct StreamEncryptor {
    enc: Aes256CbcEnc,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    #[must_use]
    pub fn new(key: &[u8; 32], iv: &[u8; CIPHER_IV_LEN]) -> Self {
        Self {
            enc: Aes256CbcEnc::new(key.into(), iv.into()),
            pending: Vec::new(),
        }
    }

    fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(BLOCK) {
            self.enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Feeds plaintext, appending any completed cipher blocks to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        while self.pending.len() >= CIPHER_BLOCK_SIZE {
            let mut chunk: Vec<u8> = self.pending.drain(..CIPHER_BLOCK_SIZE).collect();
            self.encrypt_in_place(&mut chunk);
            out.extend_from_slice(&chunk);
        }
    }

    /// Pads (PKCS7) and encrypts the remainder. Always emits at least one
    /// block, so an empty plaintext still round-trips.
    pub fn finalize(mut self, out: &mut Vec<u8>) {
        let pad = BLOCK - (self.pending.len() % BLOCK);
        // pad is in 1..=16 and fits a byte.
        #[allow(clippy::cast_possible_truncation)]
        self.pending
            .extend(std::iter::repeat(pad as u8).take(pad));
        let mut tail = std::mem::take(&mut self.pending);
        self.encrypt_in_place(&mut tail);
        out.extend_from_slice(&tail);
    }
}

/// Incremental AES-256-CBC decryptor.
#[derive(Debug)]
pub struct StreamDecryptor {
    dec: Aes256CbcDec,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    #[must_use]
    pub fn new(key: &[u8; 32], iv: &[u8; CIPHER_IV_LEN]) -> Self {
        Self {
            dec: Aes256CbcDec::new(key.into(), iv.into()),
            pending: Vec::new(),
        }
    }

    fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(BLOCK) {
            self.dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Feeds ciphertext, appending plaintext to `out`.
    ///
    /// The last full block is always withheld: it may be the final, padded
    /// one, which only [`finalize`](Self::finalize) may decrypt.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(input);
        let full_blocks = self.pending.len() / BLOCK;
        if full_blocks > 1 {
            let take = (full_blocks - 1) * BLOCK;
            let mut chunk: Vec<u8> = self.pending.drain(..take).collect();
            self.decrypt_in_place(&mut chunk);
            out.extend_from_slice(&chunk);
        }
    }

    /// Decrypts the withheld final block and strips the PKCS7 padding.
    pub fn finalize(mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.pending.len() != BLOCK {
            return Err(CryptoError::Truncated);
        }
        let mut tail = std::mem::take(&mut self.pending);
        self.decrypt_in_place(&mut tail);

        let Some(&last) = tail.last() else {
            return Err(CryptoError::Truncated);
        };
        let pad = usize::from(last);
        if pad == 0 || pad > BLOCK {
            return Err(CryptoError::BadPadding);
        }
        #[allow(clippy::cast_possible_truncation)]
        if !tail[BLOCK - pad..].iter().all(|&b| b == pad as u8) {
            return Err(CryptoError::BadPadding);
        }
        out.extend_from_slice(&tail[..BLOCK - pad]);
        Ok(())
    }
}

/// `AsyncRead` adapter decrypting an inner byte source on the fly.
///
/// Used by the restore stream so the line parser reads plaintext regardless
/// of whether the backup was encrypted.
#[derive(Debug)]
pub struct DecryptReader<R> {
    inner: R,
    decryptor: Option<StreamDecryptor>,
    plain: Vec<u8>,
    pos: usize,
    scratch: Box<[u8]>,
    finished: bool,
}

impl<R> DecryptReader<R> {
    #[must_use]
    pub fn new(inner: R, decryptor: StreamDecryptor) -> Self {
        Self {
            inner,
            decryptor: Some(decryptor),
            plain: Vec::new(),
            pos: 0,
            scratch: vec![0_u8; 8 * 1024].into_boxed_slice(),
            finished: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Serve buffered plaintext first.
            if this.pos < this.plain.len() {
                let available = &this.plain[this.pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pos += n;
                if this.pos == this.plain.len() {
                    this.plain.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut scratch = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) => {
                    let filled = scratch.filled();
                    if filled.is_empty() {
                        this.finished = true;
                        if let Some(decryptor) = this.decryptor.take() {
                            let mut out = Vec::new();
                            decryptor.finalize(&mut out).map_err(|error| {
                                std::io::Error::new(std::io::ErrorKind::InvalidData, error)
                            })?;
                            this.plain = out;
                            this.pos = 0;
                        }
                    } else if let Some(decryptor) = this.decryptor.as_mut() {
                        let mut out = Vec::new();
                        decryptor.feed(filled, &mut out);
                        this.plain = out;
                        this.pos = 0;
                    }
                }
            }
        }
    }
}
