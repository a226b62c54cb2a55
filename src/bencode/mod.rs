mod decoder;
mod value;

pub use decoder::decode_with_span;
pub use value::BencodeValue;
