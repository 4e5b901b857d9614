//! Identifier generation

use crate::entity::EntityKind;
use crate::types::EntityId;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// `claim_1...` for expense claims, `ticket_1...` for tickets.
pub fn new_entity_id(kind: EntityKind) -> anyhow::Result<EntityId> {
    Ok(EntityId::new(new_uuid_to_bech32(kind.id_prefix())?))
}
