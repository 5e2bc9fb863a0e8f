pub mod file;

pub use file::FileProviderRepository;
