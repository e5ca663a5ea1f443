// 分享链接编解码：vmess / vless / trojan / ss / hysteria / hysteria2

pub mod codec;
mod hysteria;
mod standard;
mod vmess;

pub use codec::{ShareLinkError, decode_base64_lenient, emit, parse};
