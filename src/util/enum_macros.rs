/// Generates an enum for a BACnet enumeration that is extensible by vendors:
/// named standard values, a `Proprietary` variant for values inside the
/// vendor range and a `Reserved` variant for unassigned values outside it.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - Named standard values.
/// * `$unit:ident` - The underlying integer type (e.g., `u8`, `u16`, `u32`).
/// * `$range:expr` - The range ASHRAE 135 leaves to vendors (e.g., `64..=255`).
///
/// # Example
///
/// ```rust
/// use bacnet_tsm::reason_enum;
///
/// reason_enum! {
///     LinkFault {
///         Framing = 0,
///         Parity = 1,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(LinkFault::from(1u8), LinkFault::Parity);
/// assert_eq!(u8::from(LinkFault::Framing), 0);
/// assert!(matches!(LinkFault::from(70u8), LinkFault::Proprietary(v) if v.value() == 70));
/// assert!(matches!(LinkFault::from(9u8), LinkFault::Reserved(v) if v.value() == 9));
/// assert_eq!(LinkFault::Parity.to_string(), "Parity");
/// ```
///
/// Alongside the enum the macro emits a `<Name>Value` newtype for the
/// payload of the open variants, `Display`, and lossless `From` conversions
/// in both directions.
#[macro_export]
macro_rules! reason_enum {
    ($(#[$doc:meta])* $name:ident { $($(#[$vdoc:meta])* $variant:ident = $value:literal,)+ }, $unit:ident, $proprietary_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($(#[$vdoc])* $variant,)*
                Proprietary( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                pub fn is_proprietary(&self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Proprietary( value ) => write!(f, "Proprietary({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary( value ) | $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($proprietary_range).contains(&v) => {
                            $name::Proprietary( [<$name Value>] { value: v } )
                        }
                        v => $name::Reserved( [<$name Value>] { value: v } ),
                    }
                }
            }
        }
    };
}
