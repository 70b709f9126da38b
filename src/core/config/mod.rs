pub mod data;
pub mod defaults;
pub mod io;
pub mod printing;
pub mod settings;


pub use data::Config;
pub use defaults::ClientConfig;
pub use io::ConfigError;
