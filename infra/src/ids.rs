use std::cmp::Ordering;
use std::convert::TryInto;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use data_encoding::BASE32HEX_NOPAD;
use err_derive::Error;
use hex_slice::AsHex;
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const DIVIDER: &str = "-";
const ID_LEN: usize = 16;

pub struct Id<T> {
    val: [u8; ID_LEN],
    phantom: PhantomData<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error(display = "invalid prefix, expected {:?}", _0)]
    InvalidPrefix(&'static str),
    #[error(display = "unparseable id")]
    Unparseable,
}

pub trait Entity {
    const PREFIX: &'static str;
}

/// Mints identifiers whose leading bytes are the creation time, so that
/// lexical order of the rendered id follows creation order.
#[derive(Debug, Default, Clone)]
pub struct IdGen {
    _private: (),
}

impl IdGen {
    pub fn new() -> Self {
        IdGen { _private: () }
    }

    pub fn generate<T>(&self) -> Id<T> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let random: u64 = rand::thread_rng().gen();

        let mut val = [0u8; ID_LEN];
        val[..8].copy_from_slice(&nanos.to_be_bytes());
        val[8..].copy_from_slice(&random.to_be_bytes());
        Id {
            val,
            phantom: PhantomData,
        }
    }
}

impl<T> Id<T> {
    pub fn hashed<H: Hash + ?Sized>(entity: &H) -> Self {
        let mut val = [0u8; ID_LEN];
        for (i, chunk) in val.chunks_mut(8).enumerate() {
            let mut h = siphasher::sip::SipHasher24::new_with_keys(0, i as u64);
            entity.hash(&mut h);
            chunk.copy_from_slice(&h.finish().to_be_bytes());
        }
        Id {
            val,
            phantom: PhantomData,
        }
    }

    /// Only meaningful for ids minted by `IdGen`.
    pub fn timestamp(&self) -> SystemTime {
        let nanos = u64::from_be_bytes(self.val[..8].try_into().unwrap_or_default());
        UNIX_EPOCH + Duration::from_nanos(nanos)
    }
}

impl<T> Distribution<Id<T>> for Standard {
    fn sample<R: ?Sized + rand::Rng>(&self, rng: &mut R) -> Id<T> {
        let val = rng.gen();
        Id {
            val,
            phantom: PhantomData,
        }
    }
}

impl<T: Entity> fmt::Display for Id<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}{}{}",
            T::PREFIX,
            DIVIDER,
            BASE32HEX_NOPAD.encode(&self.val)
        )
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Id")
            .field("val", &format_args!("{:x}", self.val.as_hex()))
            .finish()
    }
}

impl<T: Entity> std::str::FromStr for Id<T> {
    type Err = IdParseError;
    fn from_str(src: &str) -> Result<Self, Self::Err> {
        if !src.starts_with(T::PREFIX) {
            return Err(IdParseError::InvalidPrefix(T::PREFIX));
        }
        let remainder = &src[T::PREFIX.len()..];
        if !remainder.starts_with(DIVIDER) {
            return Err(IdParseError::Unparseable);
        }
        let encoded = &remainder[DIVIDER.len()..];

        let bytes = BASE32HEX_NOPAD
            .decode(encoded.as_bytes())
            .map_err(|_| IdParseError::Unparseable)?;
        if bytes.len() != ID_LEN {
            return Err(IdParseError::Unparseable);
        }
        let mut id = Id::default();
        id.val.copy_from_slice(&bytes);
        Ok(id)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        let val = Default::default();
        let phantom = PhantomData;
        Id { val, phantom }
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.val.cmp(&other.val)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.val.hash(state)
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T: Entity> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, T: Entity> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdStrVisitor<T>(PhantomData<T>);
        impl<'vi, T: Entity> de::Visitor<'vi> for IdStrVisitor<T> {
            type Value = Id<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "an Id string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Id<T>, E> {
                value.parse::<Id<T>>().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdStrVisitor(PhantomData))
    }
}
