//! Data model shared by the kubefleet control plane.
//!
//! Every persistent row implements [`Record`], which is all the store needs
//! to file it under a table (`KIND`) and address it by id. Rows are plain
//! data: the behaviour lives in the `kubefleet` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const API_GROUP: &'static str = "kubefleet.io";

/// Label put on every object the control plane creates in a member cluster.
pub const MANAGED_BY_LABEL: &'static str = "app.kubernetes.io/managed-by";

/// Annotation linking a materialized object back to its federated resource.
pub const FEDERATED_ANNOTATION: &'static str = "kubefleet.io/federated-resource";

/// A row of the control-plane store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table name.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn name(&self) -> &str;
}

/// Columns every standalone row carries.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ObjectBase {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectBase {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Declares a closed, string-valued enum with its wire names.
///
/// Generates `as_str`, `ALL`, `Display` and `FromStr` so the same
/// spelling is used by serde, store predicates and log lines.
#[macro_export]
macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize, ::schemars::JsonSchema)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value {:?}", stringify!($name), other)),
                }
            }
        }
    };
}

mod cluster;
mod component;
mod federation;
mod machine;
mod resource;
mod task;

pub use cluster::*;
pub use component::*;
pub use federation::*;
pub use machine::*;
pub use resource::*;
pub use task::*;

/// Identity of the caller on whose behalf an operation runs.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct UserCred {
    pub user_id: String,
    pub user_name: String,
    pub project_id: String,
    pub domain_id: String,
    pub is_system_admin: bool,
}

impl UserCred {
    /// The credential used by background loops.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            user_name: "system".to_string(),
            project_id: "system".to_string(),
            domain_id: "default".to_string(),
            is_system_admin: true,
        }
    }
}
