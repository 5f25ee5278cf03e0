pub mod enum_def;
pub mod sqlite;
