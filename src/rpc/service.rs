use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::{Args, Value};

/// Description of one remotely callable method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    /// Human-readable parameter list, e.g. `"(x, y)"`.
    pub signature: String,
    pub doc: String,
}

impl MethodDescriptor {
    pub fn new(name: &str, signature: &str, doc: &str) -> MethodDescriptor {
        MethodDescriptor {
            name: name.to_string(),
            signature: signature.to_string(),
            doc: doc.to_string(),
        }
    }
}

/// Description of one signal a service may publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDescriptor {
    pub name: String,
    pub doc: String,
}

impl SignalDescriptor {
    pub fn new(name: &str, doc: &str) -> SignalDescriptor {
        SignalDescriptor {
            name: name.to_string(),
            doc: doc.to_string(),
        }
    }
}

/// The method and signal catalogues of a service, computed once when the
/// service is registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub methods: Vec<MethodDescriptor>,
    pub signals: Vec<SignalDescriptor>,
}

impl ServiceDescriptor {
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|method| method.name == name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.iter().map(|method| method.name.clone()).collect()
    }

    pub fn signal_names(&self) -> Vec<String> {
        self.signals.iter().map(|signal| signal.name.clone()).collect()
    }
}

/// A long-lived object whose methods are callable locally and remotely.
///
/// All invocations against one service instance are serialised onto its
/// dedicated worker in arrival order; the implementation never needs
/// internal locking to protect state touched only by its methods.
#[async_trait]
pub trait RpcService: Send + 'static {
    /// The catalogue of methods and signals. Called once at registration;
    /// requests naming a method outside the catalogue are refused with
    /// `UnknownMethod` without reaching the service.
    fn describe(&self) -> ServiceDescriptor;

    /// Invoke a method by name. Errors returned here travel to the caller
    /// as remote exceptions with their kind preserved.
    async fn call(&mut self, method: &str, args: &Args) -> Result<Value, Error>;

    /// Called once when the service is removed from its context, just
    /// before the instance is dropped. Release external resources here.
    async fn released(&mut self) {}
}
