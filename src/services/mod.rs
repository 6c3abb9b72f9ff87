pub mod chat_orchestrator;
pub mod chat_repository;
pub mod job_manager;
pub mod ollama_service;
pub mod stream_decoder;
pub mod thinking_segmenter;
