//! # Network Module
//!
//! Peer-to-peer sync protocol between devices of one user.
//!
//! ## Network Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         NETWORK STACK                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Application Messages                         │   │
//! │  │                                                                 │   │
//! │  │  hello / helloBack            - trust handshake                │   │
//! │  │  transactions                 - encrypted ledger fragments     │   │
//! │  │  transactionConfirmation      - per-chunk receipt              │   │
//! │  │  finishedSending / backedUp   - end of a sync round            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                              │                                          │
//! │                              ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Per-connection state                         │   │
//! │  │                                                                 │   │
//! │  │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐     │   │
//! │  │  │  Handshake  │  │ Reassembler │  │  Delivery tracker   │     │   │
//! │  │  │             │  │             │  │                     │     │   │
//! │  │  │ trust gate  │  │ chunk       │  │ sent vs confirmed   │     │   │
//! │  │  │             │  │ offsets     │  │ chunks              │     │   │
//! │  │  └─────────────┘  └─────────────┘  └─────────────────────┘     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                              │                                          │
//! │                              ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      Transport Layer                            │   │
//! │  │                                                                 │   │
//! │  │  Data: WebRTC data channel via the PeerTransport seam          │   │
//! │  │  Signaling: WebSocket relay (SignalingClient)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Flow
//!
//! ```text
//! Device A                        Relay                        Device B
//!    │── init{alice} ───────────────►│                              │
//!    │◄────────── socketIds{[B]} ────│                              │
//!    │ create B as initiator         │                              │
//!    │── signal{B, offer} ──────────►│── signal{A, offer} ─────────►│
//!    │                               │          create A as responder
//!    │◄───────── signal{B, answer} ──│◄──────── signal{A, answer} ──│
//!    │                                                              │
//!    │════════════════ data channel open ═══════════════════════════│
//!    │── hello{laptop, enc(nA)} ───────────────────────────────────►│
//!    │◄─────────────────────────────────── hello{phone, enc(nB)} ───│
//!    │── helloBack{nB} ────────────────────────────────────────────►│ trusts A
//!    │◄───────────────────────────────────────────── helloBack{nA} ─│
//!  trusts B                                                         │
//! ```

pub mod chunking;
pub mod delivery;
pub mod handshake;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod transport;

pub use chunking::{
    send_chunky, split_message, Chunk, CompletedTransfer, Reassembler, Reassembly, SentTransfer,
};
pub use delivery::{Confirmation, DeliveryTracker};
pub use handshake::{Handshake, HandshakeState};
pub use peer::{PeerConnection, PeerSummary};
pub use protocol::{MessageKind, PeerMessage};
pub use registry::PeerRegistry;
pub use signaling::{
    RelayClientData, RelayConnector, RelayEnvelope, RelayInbound, RelayLink,
    RelayServerMessage, RelayStatus, SignalRequest, SignalingClient, WebSocketConnector,
};
pub use transport::{PeerEvent, PeerEventSink, PeerTransport, TransportEvent, TransportFactory};
