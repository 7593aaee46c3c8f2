//! Addresses go over the wire as `"0x..."` strings, since nobody wants to read
//! a dump full of 140-trillion-something decimals. Plain integers are still
//! accepted when deserializing.

use std::fmt;

use serde::{
    de::{self, Visitor},
    Deserializer, Serializer,
};

pub fn serialize<S>(address: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{address:#x}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address, as an integer or a \"0x\" hex string")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))?;
            u64::from_str_radix(digits, 16)
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(V)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wrapper(#[serde(with = "super")] u64);

    #[test]
    fn writes_hex() {
        assert_eq!(serde_json::to_string(&Wrapper(0x7f00)).unwrap(), "\"0x7f00\"");
    }

    #[test]
    fn reads_hex_or_integer() {
        assert_eq!(serde_json::from_str::<Wrapper>("\"0x7f00\"").unwrap(), Wrapper(0x7f00));
        assert_eq!(serde_json::from_str::<Wrapper>("32512").unwrap(), Wrapper(0x7f00));
        assert!(serde_json::from_str::<Wrapper>("\"7f00\"").is_err());
    }
}
