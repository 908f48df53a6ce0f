pub mod backup_config;
pub mod cancel;
pub mod codec;
pub mod compress;
pub mod file_ext;
pub mod finish;
pub mod job;
pub mod producer;
pub mod redacted;
pub mod result_error;
pub mod tar;
pub mod upload;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
