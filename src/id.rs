use uuid::Uuid;

/// Time-ordered ids so job listings sort by creation without a second key.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}
