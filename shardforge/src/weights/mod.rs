//! Weight access: host buffers, parameter sources, and SafeTensors IO

mod format;
mod host;
mod safetensors;

pub use format::{HostParameters, ParameterSource};
pub use host::{
    host_cast, host_concat, host_narrow, host_pad_rows, host_shard_tensor, host_split,
    host_stack, HostTensor,
};
pub use self::safetensors::{save_safetensors, SafeTensorsLoader};
