//! Messages of the binary socket protocol.
//!
//! A packet is a header carrying the encoded byte length of the index that
//! follows it, plus the index itself: one entry per label of one image.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PacketHeader {
    /// Encoded length in bytes of `Packet::payload`.
    #[prost(uint32, tag = "1")]
    pub payload: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexEntry {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    /// Position of the label in the labeler's output.
    #[prost(uint32, tag = "2")]
    pub index: u32,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(float, tag = "4")]
    pub probability: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Index {
    #[prost(message, repeated, tag = "1")]
    pub entry: ::prost::alloc::vec::Vec<IndexEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<PacketHeader>,
    #[prost(message, optional, tag = "2")]
    pub payload: ::core::option::Option<Index>,
}
