//! Deserializers for arguments that may arrive as query-string text

use serde::de::{self, Deserializer, Unexpected};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn parse<E: de::Error>(value: NumberOrText) -> Result<u64, E> {
    match value {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| E::invalid_value(Unexpected::Str(&text), &"an unsigned integer")),
    }
}

/// Accept `7` or `"7"`
pub fn u64_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    parse(NumberOrText::deserialize(deserializer)?)
}

/// Accept `7`, `"7"` or null
pub fn opt_u64_lenient<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    Option::<NumberOrText>::deserialize(deserializer)?
        .map(parse)
        .transpose()
}
