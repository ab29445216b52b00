pub mod io_executor;
pub mod lazy_tcp;
