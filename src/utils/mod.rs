pub mod scope_guard;
pub mod task_slot;
