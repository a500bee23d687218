//! Identifier and seed generation.

/// Length of subscription ids, matching the server's `Random.id()`.
const ID_LEN: usize = 17;

/// Length of an RPC random seed in hex characters.
const SEED_LEN: usize = 20;

/// Generate a fresh random identifier (subscriptions, local documents).
pub fn random_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// Generate the seed sent as `randomSeed` with a method call, so the server
/// can reproduce ids the stub generated.
pub fn rpc_seed() -> String {
    let mut seed = uuid::Uuid::new_v4().simple().to_string();
    seed.truncate(SEED_LEN);
    seed
}
