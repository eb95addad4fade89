use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "continuation_tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub rowid: i64,
    /// `<conversation_id>:<backend>`, one live token per slot.
    #[sea_orm(unique)]
    pub slot: String,
    pub conversation_id: i64,
    pub backend: String,
    pub token: String,
    pub created_us: i64,
}

impl ActiveModelBehavior for ActiveModel {}

pub fn slot_key(conversation_id: i64, backend: &str) -> String {
    format!("{}:{}", conversation_id, backend)
}
