pub mod catalog;
pub mod schema;

pub use schema::{
    count_rows, create_index, drop_table, execute_statement, get_table_columns, table_exists,
    validate_ident,
};
