pub mod clone;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod runner;
pub mod strategy;

pub use clone::{clone_resource, CloneRequest};
pub use mongodb::MongodbTransferStrategy;
pub use mysql::MysqlTransferStrategy;
pub use postgres::PostgresqlTransferStrategy;
pub use runner::{DumpToolRunner, InMemoryToolRunner, SystemToolRunner, ToolError, ToolInvocation, ToolOutput};
pub use strategy::{ArtifactHandle, RestoreSummary, StrategyRegistry, TransferStrategy};
