use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Well-known object name of the context object itself.
pub const CONTEXT_OBJECT: &str = "$context";

/// Well-known object name of the signal manager.
pub const SIGNALS_OBJECT: &str = "$signals";

/// Object name prefix used for transient pending-call reply handlers.
pub const REQUEST_OBJECT_PREFIX: &str = "$request_";

/// Prefix of default lock tokens generated at lock time.
pub const LOCK_TOKEN_PREFIX: &str = "$lock_";

/// Unique address of a message handler: the name of the context that hosts
/// the handler plus the object name within that context.
///
/// The textual form is `"<context>.<object>"`; a bare `"<context>"` refers
/// to the context object itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub context: String,
    pub object: String,
}

impl Address {
    pub fn new(context: impl Into<String>, object: impl Into<String>) -> Address {
        Address {
            context: context.into(),
            object: object.into(),
        }
    }

    /// Address of the context object of the named context.
    pub fn context_object(context: impl Into<String>) -> Address {
        Address::new(context, CONTEXT_OBJECT)
    }

    /// Address of the signal manager of the named context.
    pub fn signal_manager(context: impl Into<String>) -> Address {
        Address::new(context, SIGNALS_OBJECT)
    }

    /// Address of the reply handler for a pending call.
    pub fn request_handler(context: impl Into<String>, request_id: u64) -> Address {
        Address::new(context, format!("{}{:016x}", REQUEST_OBJECT_PREFIX, request_id))
    }

    /// True when the object name belongs to the runtime (`$`-prefixed).
    pub fn is_internal(&self) -> bool {
        self.object.starts_with('$')
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.context, self.object)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(text: &str) -> Result<Address, Error> {
        match text.split_once('.') {
            Some((context, object)) => {
                validate_name(context)?;
                if !object.starts_with('$') {
                    validate_name(object)?;
                } else if object.len() < 2 {
                    return Err(Error::invalid_argument("empty internal object name"));
                }
                Ok(Address::new(context, object))
            }
            None => {
                validate_name(text)?;
                Ok(Address::context_object(text))
            }
        }
    }
}

/// Check that a context, object or signal name is acceptable: non-empty,
/// printable ASCII, no separators, no reserved `$` prefix.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::invalid_argument("name must not be empty"));
    }
    if name.starts_with('$') {
        return Err(Error::invalid_argument(format!(
            "name {:?} uses the reserved '$' prefix",
            name
        )));
    }
    for ch in name.chars() {
        let ok = ch.is_ascii_alphanumeric() || ch == '_' || ch == '-';
        if !ok {
            return Err(Error::invalid_argument(format!(
                "name {:?} contains invalid character {:?}",
                name, ch
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotted_form() {
        let addr: Address = "ctx1.instr".parse().unwrap();
        assert_eq!(addr, Address::new("ctx1", "instr"));
        assert_eq!(addr.to_string(), "ctx1.instr");
    }

    #[test]
    fn parse_bare_context_form() {
        let addr: Address = "ctx1".parse().unwrap();
        assert_eq!(addr, Address::new("ctx1", CONTEXT_OBJECT));
    }

    #[test]
    fn parse_internal_object() {
        let addr: Address = "ctx1.$signals".parse().unwrap();
        assert_eq!(addr.object, SIGNALS_OBJECT);
        assert!(addr.is_internal());
    }

    #[test]
    fn invalid_names_rejected() {
        assert!("".parse::<Address>().is_err());
        assert!("a b.svc".parse::<Address>().is_err());
        assert!("$ctx.svc".parse::<Address>().is_err());
        assert!(validate_name("$reserved").is_err());
        assert!(validate_name("with.dot").is_err());
        assert!(validate_name("ok_name-1").is_ok());
    }

    #[test]
    fn request_handler_addresses_are_unique_per_id() {
        let a = Address::request_handler("ctx", 1);
        let b = Address::request_handler("ctx", 2);
        assert_ne!(a, b);
        assert!(a.object.starts_with(REQUEST_OBJECT_PREFIX));
    }
}
