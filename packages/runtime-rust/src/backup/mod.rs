//! Line-delimited backup/restore streams with optional transparent
//! encryption.
//!
//! Wire format:
//!
//! ```text
//! CACHE_BACKUP v1
//! CREATED_AT <ISO-8601>
//! RECORD <one JSON record>
//! RECORD <...>
//! END_BACKUP
//! ```
//!
//! The magic line is always plaintext. With a passphrase configured, the
//! rest of the body is AES-256-CBC ciphertext framed as `IV(16) || blocks`;
//! restore inserts the matching decrypting transform. Backpressure rides on
//! the sink: `write_record` awaits the writer, so a slow driver throttles
//! the producer.

pub mod crypto;

use cachegrid_core::{
    RecordDump, BACKUP_CREATED_AT_PREFIX, BACKUP_END, BACKUP_MAGIC, BACKUP_RECORD_PREFIX,
    CIPHER_IV_LEN,
};
use chrono::SecondsFormat;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::either::Either;

use crypto::{derive_key, random_iv, DecryptReader, StreamDecryptor, StreamEncryptor};

/// Writer half: serializes record dumps into the backup wire format.
pub struct BackupStream<W: AsyncWrite + Unpin + Send> {
    sink: W,
    encryptor: Option<StreamEncryptor>,
    records_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> BackupStream<W> {
    /// Writes the magic line (and IV when encrypting) plus the creation
    /// timestamp, returning the ready-to-write stream.
    pub async fn open(mut sink: W, passphrase: Option<&str>) -> anyhow::Result<Self> {
        sink.write_all(BACKUP_MAGIC.as_bytes()).await?;
        sink.write_all(b"\n").await?;

        let encryptor = match passphrase {
            Some(passphrase) => {
                let iv = random_iv();
                sink.write_all(&iv).await?;
                Some(StreamEncryptor::new(&derive_key(passphrase), &iv))
            }
            None => None,
        };

        let mut stream = Self {
            sink,
            encryptor,
            records_written: 0,
        };
        let created_at = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        stream
            .write_line(&format!("{BACKUP_CREATED_AT_PREFIX}{created_at}"))
            .await?;
        Ok(stream)
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        match self.encryptor.as_mut() {
            Some(encryptor) => {
                let mut ciphertext = Vec::new();
                encryptor.feed(&bytes, &mut ciphertext);
                if !ciphertext.is_empty() {
                    self.sink.write_all(&ciphertext).await?;
                }
            }
            None => self.sink.write_all(&bytes).await?,
        }
        Ok(())
    }

    /// Writes one `RECORD` line.
    pub async fn write_record(&mut self, dump: &RecordDump) -> anyhow::Result<()> {
        let json = serde_json::to_string(dump)?;
        self.write_line(&format!("{BACKUP_RECORD_PREFIX}{json}"))
            .await?;
        self.records_written += 1;
        Ok(())
    }

    /// Records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Writes the terminator, finalizes the cipher, and shuts the sink down.
    pub async fn finish(mut self) -> anyhow::Result<u64> {
        self.write_line(BACKUP_END).await?;
        if let Some(encryptor) = self.encryptor.take() {
            let mut tail = Vec::new();
            encryptor.finalize(&mut tail);
            self.sink.write_all(&tail).await?;
        }
        self.sink.flush().await?;
        self.sink.shutdown().await?;
        Ok(self.records_written)
    }
}

type RestoreFrames<R> = FramedRead<Either<R, DecryptReader<R>>, LinesCodec>;

/// Reader half: parses the wire format back into record dumps.
#[derive(Debug)]
pub struct RestoreStream<R: AsyncRead + Unpin + Send> {
    frames: RestoreFrames<R>,
}

impl<R: AsyncRead + Unpin + Send> RestoreStream<R> {
    /// Validates the magic line and installs the decrypting transform when a
    /// passphrase is configured.
    pub async fn open(mut source: R, passphrase: Option<&str>) -> anyhow::Result<Self> {
        let mut magic = Vec::new();
        loop {
            let byte = source
                .read_u8()
                .await
                .map_err(|_| anyhow::anyhow!("stream ended before the backup magic line"))?;
            if byte == b'\n' {
                break;
            }
            magic.push(byte);
            anyhow::ensure!(magic.len() <= 256, "missing backup magic line");
        }
        let magic_line = std::str::from_utf8(&magic)
            .map_err(|_| anyhow::anyhow!("backup magic line is not UTF-8"))?
            .trim_end_matches('\r');
        anyhow::ensure!(
            magic_line == BACKUP_MAGIC,
            "not a cache backup stream (magic {magic_line:?})"
        );

        let reader = match passphrase {
            Some(passphrase) => {
                let mut iv = [0_u8; CIPHER_IV_LEN];
                source.read_exact(&mut iv).await?;
                Either::Right(DecryptReader::new(
                    source,
                    StreamDecryptor::new(&derive_key(passphrase), &iv),
                ))
            }
            None => Either::Left(source),
        };
        Ok(Self {
            frames: FramedRead::new(reader, LinesCodec::new()),
        })
    }

    /// Next `RECORD` line, parsed. Lines not starting with the record
    /// prefix (the timestamp, the terminator, noise) are skipped.
    pub async fn next_record(&mut self) -> anyhow::Result<Option<RecordDump>> {
        while let Some(line) = self.frames.next().await {
            let line = line?;
            if let Some(json) = line.strip_prefix(BACKUP_RECORD_PREFIX) {
                let dump: RecordDump = serde_json::from_str(json)?;
                return Ok(Some(dump));
            }
        }
        Ok(None)
    }
}
