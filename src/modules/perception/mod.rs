pub mod structs;
pub mod fingerprint;
pub mod holdings;
pub mod news;

pub use structs::{
    CandidateArticle, EnrichedArticle, Enrichment, GatewayError, Sentiment, TickerOutcome,
    TickerSource,
};
pub use holdings::HoldingsGateway;
pub use news::{NewsSearcher, SearchProfile};
