use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ExecutionId);
id_newtype!(ProfileUuid);
id_newtype!(DeclarationUuid);

numeric_id!(HostId);
numeric_id!(TeamId);
numeric_id!(LabelId);
numeric_id!(InstallerId);
numeric_id!(VppAppId);
numeric_id!(PolicyId);

/// Identity of anything that can be deployed to a host.
///
/// Resolved once at the boundary (`parse`) and carried as a sum type from then
/// on; business logic never inspects string prefixes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetId {
    SoftwareInstaller(InstallerId),
    MdmProfile(ProfileUuid),
    MdmDeclaration(DeclarationUuid),
    VppApp(VppAppId),
}

impl TargetId {
    /// Parses the `kind:id` form, e.g. `installer:12` or `profile:a1b2`.
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidState(format!("malformed target id '{s}'")))?;
        if id.is_empty() {
            return Err(Error::InvalidState(format!("malformed target id '{s}'")));
        }
        let numeric = |id: &str| {
            id.parse::<u64>()
                .map_err(|_| Error::InvalidState(format!("target id '{s}' is not numeric")))
        };
        match kind {
            "installer" => Ok(Self::SoftwareInstaller(InstallerId(numeric(id)?))),
            "profile" => Ok(Self::MdmProfile(ProfileUuid::from_str(id))),
            "declaration" => Ok(Self::MdmDeclaration(DeclarationUuid::from_str(id))),
            "vpp" => Ok(Self::VppApp(VppAppId(numeric(id)?))),
            other => Err(Error::InvalidState(format!("unknown target kind '{other}'"))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SoftwareInstaller(_) => "installer",
            Self::MdmProfile(_) => "profile",
            Self::MdmDeclaration(_) => "declaration",
            Self::VppApp(_) => "vpp",
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self, Self::SoftwareInstaller(_) | Self::VppApp(_))
    }

    pub fn is_mdm_profile(&self) -> bool {
        matches!(self, Self::MdmProfile(_) | Self::MdmDeclaration(_))
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoftwareInstaller(id) => write!(f, "installer:{id}"),
            Self::MdmProfile(uuid) => write!(f, "profile:{uuid}"),
            Self::MdmDeclaration(uuid) => write!(f, "declaration:{uuid}"),
            Self::VppApp(id) => write!(f, "vpp:{id}"),
        }
    }
}

impl FromStr for TargetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TargetId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.to_string()
    }
}
