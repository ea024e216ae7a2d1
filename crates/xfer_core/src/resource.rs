use serde::{Deserialize, Serialize};

/// Closed set of resource kinds the transfer engine knows how to move.
/// Strategy selection matches on this tag; there is no runtime reflection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Application,
    Service,
    Postgresql,
    Mysql,
    Mongodb,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Application => "application",
            ResourceKind::Service => "service",
            ResourceKind::Postgresql => "postgresql",
            ResourceKind::Mysql => "mysql",
            ResourceKind::Mongodb => "mongodb",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "application" => Some(ResourceKind::Application),
            "service" => Some(ResourceKind::Service),
            "postgresql" => Some(ResourceKind::Postgresql),
            "mysql" => Some(ResourceKind::Mysql),
            "mongodb" => Some(ResourceKind::Mongodb),
            _ => None,
        }
    }

    /// Database sources carry data and go through the async dump/restore
    /// job; everything else is a configuration-only clone.
    pub fn is_database(&self) -> bool {
        matches!(
            self,
            ResourceKind::Postgresql | ResourceKind::Mysql | ResourceKind::Mongodb
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach a database resource. Supplied by the resource catalog; the
/// engine never persists credentials on the transfer record itself.
///
/// `objects` lists the tables (or collections) known to exist on the
/// instance, so strategies can fail fast on a name that is not there
/// instead of silently skipping it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeDefinition {
    pub name: String,
    pub mount_path: String,
    pub host_path: Option<String>,
}

/// Configuration snapshot of an application or service, as handed out by
/// the resource catalog. Clone actions duplicate this into a new resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub env_vars: Vec<EnvVar>,
    pub volumes: Vec<VolumeDefinition>,
    pub settings: serde_json::Value,
}
