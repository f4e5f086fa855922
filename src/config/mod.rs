pub mod pipeline_profile;
