pub mod layout;
pub mod object_store;
pub mod quota;
