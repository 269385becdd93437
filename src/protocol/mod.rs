//! Wire protocol: typed envelopes and the AEAD codec.

pub mod codec;
pub mod types;

pub use types::{
    AckResponse, GitSignRequest, GitSignResponse, HostAuth, HostInfo, HostsRequest, HostsResponse,
    ListRequest, ListResponse, MeRequest, MeResponse, NoOpRequest, Profile, Request, Response,
    SignRequest, SignResponse, UserAndHost,
};
