use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Enums persisted as short snake_case strings.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidState(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Darwin,
    Ios,
    Ipados,
    Windows,
    Linux,
}

str_enum!(Platform {
    Darwin => "darwin",
    Ios => "ios",
    Ipados => "ipados",
    Windows => "windows",
    Linux => "linux",
});

impl Platform {
    pub fn is_apple(&self) -> bool {
        matches!(self, Self::Darwin | Self::Ios | Self::Ipados)
    }

    /// Which family of configuration profiles applies, if any.
    pub fn profile_platform(&self) -> Option<ProfilePlatform> {
        match self {
            Self::Darwin | Self::Ios | Self::Ipados => Some(ProfilePlatform::Apple),
            Self::Windows => Some(ProfilePlatform::Windows),
            Self::Linux => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProfilePlatform {
    Apple,
    Windows,
}

str_enum!(ProfilePlatform {
    Apple => "apple",
    Windows => "windows",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    SoftwareInstall,
    SoftwareUninstall,
    ScriptRun,
    MdmCommand,
    VppAppInstall,
}

str_enum!(ActivityType {
    SoftwareInstall => "software_install",
    SoftwareUninstall => "software_uninstall",
    ScriptRun => "script_run",
    MdmCommand => "mdm_command",
    VppAppInstall => "vpp_app_install",
});

impl ActivityType {
    /// Activity types that deliver software and therefore get cancelled when
    /// their installer changes.
    pub const SOFTWARE: [ActivityType; 3] = [
        ActivityType::SoftwareInstall,
        ActivityType::SoftwareUninstall,
        ActivityType::VppAppInstall,
    ];

    pub fn operation(&self) -> OperationType {
        match self {
            Self::SoftwareUninstall => OperationType::Remove,
            _ => OperationType::Install,
        }
    }
}

/// Lifecycle of a host delivery record. A record with no status is pending
/// dispatch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
}

str_enum!(DeliveryStatus {
    Pending => "pending",
    Verifying => "verifying",
    Verified => "verified",
    Failed => "failed",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Install,
    Remove,
}

str_enum!(OperationType {
    Install => "install",
    Remove => "remove",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelScopeKind {
    IncludeAll,
    IncludeAny,
    ExcludeAny,
}

str_enum!(LabelScopeKind {
    IncludeAll => "include_all",
    IncludeAny => "include_any",
    ExcludeAny => "exclude_any",
});

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelMembershipType {
    #[default]
    Dynamic,
    Manual,
    HostVitals,
}

str_enum!(LabelMembershipType {
    Dynamic => "dynamic",
    Manual => "manual",
    HostVitals => "host_vitals",
});

/// Host-facing software status derived from the latest delivery record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SoftwareStatus {
    PendingInstall,
    FailedInstall,
    Installed,
    PendingUninstall,
    FailedUninstall,
}

str_enum!(SoftwareStatus {
    PendingInstall => "pending_install",
    FailedInstall => "failed_install",
    Installed => "installed",
    PendingUninstall => "pending_uninstall",
    FailedUninstall => "failed_uninstall",
});

impl SoftwareStatus {
    /// A completed uninstall leaves nothing to report.
    pub fn derive(operation: OperationType, status: Option<DeliveryStatus>) -> Option<Self> {
        match (operation, status) {
            (OperationType::Install, Some(DeliveryStatus::Verified)) => Some(Self::Installed),
            (OperationType::Install, Some(DeliveryStatus::Failed)) => Some(Self::FailedInstall),
            (OperationType::Install, _) => Some(Self::PendingInstall),
            (OperationType::Remove, Some(DeliveryStatus::Verified)) => None,
            (OperationType::Remove, Some(DeliveryStatus::Failed)) => Some(Self::FailedUninstall),
            (OperationType::Remove, _) => Some(Self::PendingUninstall),
        }
    }
}

/// What the transport reports back for an activated activity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActivityResult {
    /// The host received the command; verification is still outstanding.
    Acknowledged,
    /// The host reports the work done.
    Installed,
    Failed { detail: String },
}

impl ActivityResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Installed => "installed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Failed { detail } => Some(detail),
            _ => None,
        }
    }

    pub fn from_parts(label: &str, detail: Option<String>) -> Result<Self> {
        match label {
            "acknowledged" => Ok(Self::Acknowledged),
            "installed" => Ok(Self::Installed),
            "failed" => Ok(Self::Failed {
                detail: detail.unwrap_or_default(),
            }),
            other => Err(Error::InvalidState(format!("unknown activity result '{other}'"))),
        }
    }
}
