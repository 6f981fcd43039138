// Peer transport layer: framed TCP streams between contexts, the TCP
// accept loop and the UDP discovery responder. All sockets are driven by
// tokio; application work never runs on a socket path.

pub mod discovery;
pub mod framing;
pub mod listener;
pub mod peer;
