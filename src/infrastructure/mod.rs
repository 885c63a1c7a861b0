pub mod bybit_client;
pub mod private_stream;
