pub mod backoff;
pub mod buf_ext;
