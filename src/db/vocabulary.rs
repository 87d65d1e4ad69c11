//! Canonical enumerations for the categorical painting fields.
//!
//! Each enumeration is declared exactly once together with its lookup table:
//! a stable `key` persisted in the catalog database and the Chinese `token`
//! used in filenames and sidecar documents. The filename parser, the stores
//! and the sidecar codec all resolve values through these tables.

use serde::{Deserialize, Deserializer, Serialize};

macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident => ($key:literal, $token:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $token)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable identifier stored in the catalog database.
            pub fn key(self) -> &'static str {
                match self {
                    $($name::$variant => $key),+
                }
            }

            /// Chinese token used in filenames, sidecars and reports.
            pub fn token(self) -> &'static str {
                match self {
                    $($name::$variant => $token),+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.key() == key)
            }

            pub fn from_token(token: &str) -> Option<Self> {
                let token = token.trim();
                Self::ALL.iter().copied().find(|v| v.token() == token)
            }

            /// Accepts either the Chinese token or the database key.
            pub fn parse(value: &str) -> Option<Self> {
                Self::from_token(value).or_else(|| Self::from_key(value.trim()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.token())
            }
        }
    };
}

vocabulary! {
    /// Subject matter of a painting.
    Category {
        Person => ("person", "人物"),
        Landscape => ("landscape", "山水"),
        FlowerBird => ("flower_bird", "花鸟"),
    }
}

vocabulary! {
    /// Brushwork technique.
    Technique {
        Freehand => ("freehand", "写意"),
        FineBrush => ("fine_brush", "工笔"),
        OutlineOnly => ("outline_only", "白描"),
        Boneless => ("boneless", "没骨"),
    }
}

vocabulary! {
    /// Ink and colour style.
    InkColorStyle {
        InkWash => ("ink_wash", "水墨"),
        BlueGreen => ("blue_green", "青绿"),
        LightCrimson => ("light_crimson", "浅绛"),
        Colored => ("colored", "设色"),
    }
}

/// Deserializes an optional vocabulary value, mapping unknown tokens to `None`.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: LenientToken,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => T::from_any(&s),
        _ => None,
    })
}

pub(crate) trait LenientToken: Sized {
    fn from_any(value: &str) -> Option<Self>;
}

impl LenientToken for Category {
    fn from_any(value: &str) -> Option<Self> {
        Self::parse(value)
    }
}

impl LenientToken for Technique {
    fn from_any(value: &str) -> Option<Self> {
        Self::parse(value)
    }
}

impl LenientToken for InkColorStyle {
    fn from_any(value: &str) -> Option<Self> {
        Self::parse(value)
    }
}
