use fmradio_proto::protocol::Message;

/// Encode several messages into one contiguous byte stream, the way they
/// arrive on a socket.
pub fn stream_of(messages: &[Message]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in messages {
        out.extend(m.encode().expect("encode"));
    }
    out
}

/// Decode every complete frame in `buf`, returning the frames and the number
/// of bytes left over.
pub fn drain_frames(buf: &[u8]) -> (Vec<Message>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;
    while let Ok((msg, used)) = Message::decode(&buf[offset..]) {
        frames.push(msg);
        offset += used;
    }
    (frames, buf.len() - offset)
}
