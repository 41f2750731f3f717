//! Strongly-typed identifiers for domain entities.

use crate::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_name {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }
    };
}

define_name!(TenantName);
define_name!(ApplicationName);
define_name!(RegionName);

/// Identity of a managed application: the owning tenant plus the application name.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct ApplicationId {
    pub tenant: TenantName,
    pub application: ApplicationName,
}

impl ApplicationId {
    pub fn new(tenant: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            tenant: TenantName::new(tenant),
            application: ApplicationName::new(application),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tenant, self.application)
    }
}

impl std::str::FromStr for ApplicationId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((tenant, application)) if !tenant.is_empty() && !application.is_empty() => {
                Ok(Self::new(tenant, application))
            }
            _ => Err(Error::InvalidApplicationId(s.to_string())),
        }
    }
}
