pub mod receive_gene;
pub mod send_gene;
pub mod window;
