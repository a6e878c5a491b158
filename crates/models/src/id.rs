/// Id is an 8-byte identifier for purge operations, audit records, and other
/// gateway-minted entities. Ids render as 16 hex digits and sort by the
/// timestamp embedded in their upper bytes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 8]);

impl Id {
    pub fn zero() -> Self {
        Self([0u8; 8])
    }
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
    pub fn new(b: [u8; 8]) -> Self {
        Self(b)
    }
    pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex)?;
        let exact: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;

        Ok(Id(exact))
    }
}

impl std::str::FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::from_hex(s)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", u64::from_be_bytes(self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl serde::Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Id::from_hex(str_val.as_ref()).map_err(|err| D::Error::custom(format!("invalid id: {err}")))
    }
}

/// IdGenerator mints Ids by packing millisecond wall-clock time into the
/// upper six bytes, with a shard byte and wrapping sequence counter below.
/// Ids from a single generator are unique and roughly time-ordered.
pub struct IdGenerator {
    shard: u8,
    seq: u8,
    last_millis: u64,
}

impl IdGenerator {
    pub fn new(shard: u8) -> Self {
        Self {
            shard,
            seq: 0,
            last_millis: 0,
        }
    }

    pub fn next(&mut self) -> Id {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .expect("wall clock is before the unix epoch")
            .as_millis() as u64;

        if millis == self.last_millis {
            self.seq = self.seq.wrapping_add(1);
        } else {
            self.last_millis = millis;
            self.seq = 0;
        }

        let mut b = ((millis << 16) | ((self.shard as u64) << 8) | self.seq as u64).to_be_bytes();
        // Ids are never zero, even with a zeroed clock in tests.
        if b == [0u8; 8] {
            b[7] = 1;
        }
        Id(b)
    }
}
