use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "conversation_members")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub rowid: i64,
    #[sea_orm(unique)]
    pub membership: String,
    pub conversation_id: i64,
    pub identity_id: i64,
    pub touched_us: i64,
}

impl ActiveModelBehavior for ActiveModel {}

pub fn membership_key(conversation_id: i64, identity_id: i64) -> String {
    format!("{}:{}", conversation_id, identity_id)
}
