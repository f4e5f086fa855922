pub mod llm;

pub use llm::ArticleAnalyst;
