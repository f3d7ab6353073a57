//! Parameter list macro.
//!
//! Builds a [`Params`](crate::models::Params) value from literal arguments so
//! call sites stay readable. Every argument goes through `Value::from`, so any
//! type with a `From` impl into `Value` can be passed directly.

/// Build statement parameters.
///
/// # Example
///
/// ```
/// use pgkit::params;
/// use pgkit::models::{Params, Value};
///
/// assert_eq!(params![], Params::None);
/// assert_eq!(params![1, "ann"], Params::Positional(vec![Value::Int(1), Value::from("ann")]));
///
/// let named = params! { id => 1, name => "ann" };
/// assert_eq!(named.get_named("name"), Some(&Value::from("ann")));
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::models::Params::None
    };
    ($($name:ident => $value:expr),+ $(,)?) => {
        $crate::models::Params::Named(vec![
            $((stringify!($name).to_string(), $crate::models::Value::from($value)),)+
        ])
    };
    ($($value:expr),+ $(,)?) => {
        $crate::models::Params::Positional(vec![$($crate::models::Value::from($value),)+])
    };
}

pub use params;
