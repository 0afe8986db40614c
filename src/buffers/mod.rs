pub mod gene_buf;
pub mod gene_pool;
