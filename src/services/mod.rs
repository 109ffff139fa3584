pub mod index_store;
pub mod repository;

pub use index_store::{decode_json, encode_json, encode_json_gz};
pub use repository::{ChartRepository, RepositoryOptions};
