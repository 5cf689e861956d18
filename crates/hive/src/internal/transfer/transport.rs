use tokio::net::TcpStream;
use tokio_util::codec::length_delimited::{Builder, LengthDelimitedCodec};
use tokio_util::codec::Framed;

pub(crate) fn make_protocol_builder() -> Builder {
    *LengthDelimitedCodec::builder()
        .little_endian()
        .max_frame_length(crate::MAX_FRAME_SIZE)
}

pub fn make_framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    make_protocol_builder().new_framed(stream)
}
