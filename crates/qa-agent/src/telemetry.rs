use qa_core::ContextMetadata;
use tracing::info;

// 每个节点在结束时输出一条结构化记录；
// 字段只含脱敏后的查询长度，不落原文。

pub fn log_retrieval(
    thread_id: &str,
    query_length: usize,
    doc_count: usize,
    latency_ms: u64,
    query_language: &str,
    filters_applied: bool,
) {
    info!(
        event = "retrieval_completed",
        node = "retrieve",
        thread_id,
        query_length,
        doc_count,
        latency_ms,
        query_language,
        filters_applied,
    );
}

pub fn log_rerank(thread_id: &str, original_count: usize, reranked_count: usize, latency_ms: u64) {
    info!(
        event = "rerank_completed",
        node = "rerank",
        thread_id,
        original_count,
        reranked_count,
        latency_ms,
    );
}

pub fn log_grading(
    thread_id: &str,
    initial_count: usize,
    kept_count: usize,
    latency_ms: u64,
    batch_mode: bool,
) {
    info!(
        event = "grading_completed",
        node = "grade",
        thread_id,
        initial_count,
        kept_count,
        filtered_count = initial_count - kept_count,
        latency_ms,
        batch_mode,
    );
}

pub fn log_rewrite(thread_id: &str, retries: u32, changed: bool, latency_ms: u64) {
    info!(
        event = "rewrite_completed",
        node = "rewrite_query",
        thread_id,
        retries,
        changed,
        latency_ms,
    );
}

pub fn log_generation(
    thread_id: &str,
    query_length: usize,
    doc_count: usize,
    latency_ms: u64,
    metadata: &ContextMetadata,
) {
    info!(
        event = "generation_completed",
        node = "generate",
        thread_id,
        query_length,
        doc_count,
        latency_ms,
        tokens_input = metadata.tokens_input,
        tokens_output = metadata.tokens_output,
        confidence = metadata.confidence_score,
        warning_count = metadata.warnings.len(),
    );
}

pub fn log_request_completed(
    thread_id: &str,
    query_length: usize,
    retries: u32,
    total_duration_ms: u64,
    terminal: &str,
) {
    info!(
        event = "request_completed",
        thread_id,
        query_length,
        retries,
        total_duration_ms,
        terminal,
    );
}
