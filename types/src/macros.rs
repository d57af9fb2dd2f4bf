/// Serialize a unit-only enum by its `as_str` name and parse it back through
/// `FromStr`. Pair with `#[serde(into = "&'static str", try_from = "String")]`.
macro_rules! serde_by_name {
    ($ty:ty) => {
        impl From<$ty> for &'static str {
            fn from(value: $ty) -> Self {
                value.as_str()
            }
        }

        impl TryFrom<String> for $ty {
            type Error = $crate::TypesError;

            fn try_from(value: String) -> Result<Self, $crate::TypesError> {
                value.parse()
            }
        }
    };
}
