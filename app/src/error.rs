use std::fmt;

use err_derive::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(display = "{} not found: {}", kind, id)]
pub struct NotFound {
    pub kind: &'static str,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(display = "invalid request: {}", _0)]
pub struct ValidationError(pub String);

/// A serve request that the pantry cannot cover. Carries the names of every
/// ingredient that fell short, in recipe order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(display = "Insufficient ingredients: {}", shortfalls.join(", "))]
pub struct InsufficientStock {
    pub shortfalls: Vec<String>,
}

impl NotFound {
    pub fn new<I: fmt::Display>(kind: &'static str, id: I) -> Self {
        NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl ValidationError {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        ValidationError(msg.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insufficient_stock_lists_every_shortfall() {
        let err = InsufficientStock {
            shortfalls: vec!["Beef".into(), "Salt".into()],
        };
        assert_eq!(err.to_string(), "Insufficient ingredients: Beef, Salt");
    }

    #[test]
    fn not_found_names_the_kind() {
        assert_eq!(
            NotFound::new("meal", "meal-00").to_string(),
            "meal not found: meal-00"
        );
    }
}
