//! Wire codec for posted articles: yEnc framing, zlib compression,
//! subject obfuscation and article body assembly.

pub mod article;
pub mod compress;
pub mod error;
pub mod subject;
pub mod yenc;

pub use article::{
    build_body, generate_message_id, parse_body, sid_prefix, ArticleHeader, CODEC_VERSION,
};
pub use compress::{compress, compress_if_smaller, decompress, CompressionOutcome};
pub use error::{CodecError, Result};
pub use subject::{obfuscate_subject, SUBJECT_LEN};
pub use yenc::{YencMeta, DEFAULT_LINE_WIDTH};
