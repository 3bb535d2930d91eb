use enumset::{EnumSet, EnumSetType};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

/// Possible authentication methods in the SSH protocol.
///
/// The declaration order is the order in which methods are advertised.
#[derive(Debug, Hash, EnumSetType, EnumString, AsRefStr, IntoStaticStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Method {
    /// The SSH `none` authentication method.
    None,

    /// The SSH `publickey` authentication method.
    Publickey,

    /// The SSH `password` authentication method.
    Password,

    /// The SSH `keyboard-interactive` authentication method.
    KeyboardInteractive,

    /// The SSH `hostbased` authentication method.
    Hostbased,
}

impl Method {
    /// Parse a method from its wire name, `None` for unknown names.
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    /// The name of the method on the wire.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Wire names of a set of methods, in advertisement order.
pub fn names(methods: EnumSet<Method>) -> Vec<&'static str> {
    methods.iter().map(Method::name).collect()
}
