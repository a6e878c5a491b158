use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::time::Duration;

/// Entry is one stored value with its TTLs and bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// Stored bytes, gzip-compressed when `compressed` is set.
    pub value: Bytes,
    pub compressed: bool,
    /// Wall-clock insertion; Instants don't survive persistence.
    pub inserted_at: DateTime<Utc>,
    pub hard_ttl: Duration,
    /// Serve-stale threshold. Equal to `hard_ttl` when the caller didn't
    /// ask for stale-while-revalidate behavior.
    pub soft_ttl: Duration,
    /// Logical clock of the most recent access, for LRU.
    pub last_access: u64,
    /// Logical clock of insertion, for FIFO.
    pub inserted_tick: u64,
    pub hit_count: u64,
    /// Stored (possibly compressed) size.
    pub size_bytes: usize,
}

impl Entry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.inserted_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.hard_ttl
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.age(now) >= self.soft_ttl
    }
}

pub(crate) fn compress(value: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(
        Vec::with_capacity(value.len() / 2),
        flate2::Compression::default(),
    );
    encoder.write_all(value)?;
    encoder.finish()
}

pub(crate) fn decompress(value: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(value);
    let mut out = Vec::with_capacity(value.len() * 4);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compression_round_trips() {
        let value = "abcdefgh".repeat(4096).into_bytes();
        let packed = compress(&value).unwrap();
        assert!(packed.len() < value.len());
        assert_eq!(decompress(&packed).unwrap(), value);
    }

    #[test]
    fn garbage_does_not_decompress() {
        assert!(decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn expiry_thresholds() {
        let now = Utc::now();
        let entry = Entry {
            value: Bytes::from_static(b"v"),
            compressed: false,
            inserted_at: now - chrono::Duration::seconds(30),
            hard_ttl: Duration::from_secs(60),
            soft_ttl: Duration::from_secs(20),
            last_access: 0,
            inserted_tick: 0,
            hit_count: 0,
            size_bytes: 1,
        };

        assert!(!entry.is_expired(now));
        assert!(entry.is_stale(now));

        let later = now + chrono::Duration::seconds(31);
        assert!(entry.is_expired(later));
        assert!(!entry.is_stale(later)); // Expired dominates stale.
    }
}
