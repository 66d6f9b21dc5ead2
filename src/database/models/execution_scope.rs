use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Whether a due tick produces one run for the whole farm or one run per node.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionScope {
    /// One execution per tick, claimable by any node.
    #[sea_orm(string_value = "cluster")]
    #[default]
    Cluster,

    /// One execution per tick per node, claimable only by that node.
    #[sea_orm(string_value = "instance")]
    Instance,
}
