use crate::events::EventSink;
use crate::generator::Generator;
use crate::grader::{Grader, CONFIDENCE_THRESHOLD};
use crate::guardrails::validate_input;
use crate::intent::{canned_response, classify_intent, Intent};
use crate::rewriter::Rewriter;
use crate::session::{CheckpointBackend, SessionStore};
use crate::telemetry;
use qa_core::{
    CancelToken, ContextMetadata, Document, Event, Language, QueryRequest, QueryResponse,
    Settings, SourceDocument,
};
use qa_error::{QaError, Result};
use qa_llm::{ChatModel, EmbedModel};
use qa_rag::{detect_language, RerankAdapter, Reranker, Retriever, VectorIndex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

/// 事件通道容量；单次调用的事件数远小于此
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// 自纠错 RAG 流水线
///
/// retrieve → rerank → grade → {generate | rewrite_query}，
/// 打分失败时沿回边重试，重试次数受 MAX_RETRIES 约束。
pub struct AgentPipeline {
    chat: Arc<dyn ChatModel>,
    retriever: Retriever,
    reranker: RerankAdapter,
    grader: Grader,
    generator: Generator,
    rewriter: Rewriter,
    sessions: SessionStore,
    settings: Arc<Settings>,
}

impl AgentPipeline {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embed: Arc<dyn EmbedModel>,
        index: Arc<dyn VectorIndex>,
        reranker: Arc<dyn Reranker>,
        checkpoint: Arc<dyn CheckpointBackend>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            retriever: Retriever::new(
                embed,
                index,
                settings.retrieval_top_k as usize,
                settings.retrieval_prefetch_limit as usize,
            ),
            reranker: RerankAdapter::new(reranker, settings.rerank_top_k),
            grader: Grader::new(chat.clone(), Duration::from_secs(settings.grade_timeout_secs)),
            generator: Generator::new(
                chat.clone(),
                Duration::from_secs(settings.generate_timeout_secs),
            ),
            rewriter: Rewriter::new(
                chat.clone(),
                Duration::from_secs(settings.rewrite_timeout_secs),
            ),
            sessions: SessionStore::new(checkpoint),
            chat,
            settings,
        }
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    fn check(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(QaError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 投递事件；接收端已关闭视为客户端断开，触发取消
    async fn emit(&self, sink: &EventSink, cancel: &CancelToken, event: Event) -> Result<()> {
        if !sink.emit(event).await {
            cancel.cancel();
            return Err(QaError::Cancelled);
        }
        Ok(())
    }

    async fn emit_warning(&self, sink: &EventSink, cancel: &CancelToken, message: &str) -> Result<()> {
        self.emit(
            sink,
            cancel,
            Event::warning(serde_json::json!({ "message": message })),
        )
        .await
    }

    /// 驱动一次完整调用；恰好发出一个终止事件
    #[instrument(skip(self, request, sink, cancel), fields(thread_id = request.thread_id.as_deref().unwrap_or("")))]
    pub async fn run(
        &self,
        request: QueryRequest,
        sink: EventSink,
        cancel: CancelToken,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let query_length = request.query.chars().count();
        let deadline = Duration::from_secs(self.settings.request_deadline_secs);

        let result = match tokio::time::timeout(
            deadline,
            self.run_inner(&request, &sink, &cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(QaError::Timeout {
                    operation: "request".to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                telemetry::log_request_completed(
                    &response.thread_id,
                    query_length,
                    response.retries,
                    elapsed,
                    "generation",
                );
            }
            Err(err) => {
                // 终止 error 事件；客户端已断开时投递失败可容忍
                let _ = sink
                    .emit(Event::error(err.category(), &err.to_string()))
                    .await;
                telemetry::log_request_completed(
                    request.thread_id.as_deref().unwrap_or(""),
                    query_length,
                    0,
                    elapsed,
                    err.category(),
                );
            }
        }
        result
    }

    async fn run_inner(
        &self,
        request: &QueryRequest,
        sink: &EventSink,
        cancel: &CancelToken,
    ) -> Result<QueryResponse> {
        self.check(cancel)?;

        // 输入守卫：注入与超长直接拒绝，不进入任何节点
        let input = validate_input(&request.query, self.settings.max_query_length)?;
        let masked_query = input.masked_query;
        let mut pipeline_warnings = input.warnings.clone();

        let (thread_id, created) =
            SessionStore::canonical_thread_id(request.thread_id.as_deref());
        if created {
            self.emit(sink, cancel, Event::thread_created(&thread_id)).await?;
        }
        for w in &input.warnings {
            self.emit_warning(sink, cancel, w).await?;
        }

        let runtime_context = request.context.clone().unwrap_or_default();
        let detected = detect_language(&masked_query);
        let language = runtime_context.language_preference.resolve(detected);

        // 问候/致谢直接应答，不触发检索与生成
        let intent = classify_intent(&masked_query);
        if intent != Intent::Query {
            return self
                .answer_canned(intent, &thread_id, &masked_query, language, sink, cancel)
                .await;
        }

        // 同一线程的调用在此串行化
        let _guard = self.sessions.lock_thread(&thread_id).await;
        self.check(cancel)?;

        let mut state = self.sessions.load_or_create(&thread_id).await?;
        let history = state.messages.clone();

        let mut current_query = masked_query.clone();
        let mut retries: u32 = 0;
        let mut documents_retrieved: u32 = 0;
        let mut low_relevance_fallback = false;

        // retrieve → rerank → grade 循环，grade 失败沿回边改写重试
        let selected_documents: Vec<Document> = loop {
            self.check(cancel)?;

            // --- retrieve ---
            self.emit(sink, cancel, Event::node_start("retrieve")).await?;
            let node_started = Instant::now();
            let retrieval = self
                .retriever
                .retrieve(
                    &current_query,
                    request.filters.as_ref(),
                    request.top_k.map(|k| k as usize),
                    language,
                )
                .await?;
            for w in &retrieval.warnings {
                if !pipeline_warnings.contains(w) {
                    pipeline_warnings.push(w.clone());
                }
                self.emit_warning(sink, cancel, w).await?;
            }
            documents_retrieved = retrieval.documents.len() as u32;
            telemetry::log_retrieval(
                &thread_id,
                current_query.chars().count(),
                retrieval.documents.len(),
                node_started.elapsed().as_millis() as u64,
                language.as_str(),
                request.filters.is_some(),
            );
            self.emit(
                sink,
                cancel,
                Event::node_end(
                    "retrieve",
                    serde_json::json!({ "documents_count": retrieval.documents.len() }),
                ),
            )
            .await?;

            // --- rerank ---
            self.check(cancel)?;
            self.emit(sink, cancel, Event::node_start("rerank")).await?;
            let node_started = Instant::now();
            let original_count = retrieval.documents.len();
            let (reranked, rerank_warnings) = self
                .reranker
                .rerank_documents(&current_query, retrieval.documents)
                .await;
            for w in &rerank_warnings {
                if !pipeline_warnings.contains(w) {
                    pipeline_warnings.push(w.clone());
                }
                self.emit_warning(sink, cancel, w).await?;
            }
            telemetry::log_rerank(
                &thread_id,
                original_count,
                reranked.len(),
                node_started.elapsed().as_millis() as u64,
            );
            self.emit(
                sink,
                cancel,
                Event::node_end(
                    "rerank",
                    serde_json::json!({ "documents_count": reranked.len() }),
                ),
            )
            .await?;

            // --- grade ---
            self.check(cancel)?;
            self.emit(sink, cancel, Event::node_start("grade")).await?;
            let node_started = Instant::now();
            let graded = self.grader.grade(&current_query, reranked).await?;
            for w in &graded.warnings {
                if !pipeline_warnings.contains(w) {
                    pipeline_warnings.push(w.clone());
                }
                self.emit_warning(sink, cancel, w).await?;
            }
            telemetry::log_grading(
                &thread_id,
                graded.documents.len(),
                graded.kept,
                node_started.elapsed().as_millis() as u64,
                !graded.warnings.iter().any(|w| w == "grader_parse_failure"),
            );
            self.emit(
                sink,
                cancel,
                Event::node_end(
                    "grade",
                    serde_json::json!({
                        "documents_count": graded.documents.len(),
                        "kept_count": graded.kept,
                    }),
                ),
            )
            .await?;

            // --- 路由 ---
            let kept: Vec<Document> = graded
                .documents
                .iter()
                .filter(|d| d.passes_grading(CONFIDENCE_THRESHOLD))
                .cloned()
                .collect();
            if !kept.is_empty() {
                break kept;
            }
            if retries < self.settings.max_retries {
                self.check(cancel)?;
                self.emit(sink, cancel, Event::node_start("rewrite_query")).await?;
                let node_started = Instant::now();
                let rewrite = self.rewriter.rewrite(&current_query).await?;
                retries += 1;
                current_query = rewrite.query;
                telemetry::log_rewrite(
                    &thread_id,
                    retries,
                    rewrite.changed,
                    node_started.elapsed().as_millis() as u64,
                );
                self.emit(
                    sink,
                    cancel,
                    Event::node_end(
                        "rewrite_query",
                        serde_json::json!({ "retries": retries, "changed": rewrite.changed }),
                    ),
                )
                .await?;
                continue;
            }

            // 重试耗尽：带上最后一轮打分集合尽力生成，绝不让请求失败
            low_relevance_fallback = true;
            pipeline_warnings.push("low_relevance_fallback".to_string());
            self.emit_warning(sink, cancel, "low_relevance_fallback").await?;
            break graded.documents;
        };

        // --- generate ---
        self.check(cancel)?;
        self.emit(sink, cancel, Event::node_start("generate")).await?;
        let node_started = Instant::now();
        let generation = self
            .generator
            .generate(
                &masked_query,
                &selected_documents,
                &history,
                &runtime_context,
                language,
                documents_retrieved,
                self.settings.strict_output_guardrails,
            )
            .await?;

        let mut metadata = generation.metadata.clone();
        let mut warnings = pipeline_warnings;
        warnings.extend(metadata.warnings);
        metadata.warnings = warnings;
        if low_relevance_fallback {
            metadata.confidence_score = metadata.confidence_score.min(0.3);
        }

        telemetry::log_generation(
            &thread_id,
            masked_query.chars().count(),
            selected_documents.len(),
            node_started.elapsed().as_millis() as u64,
            &metadata,
        );
        self.emit(
            sink,
            cancel,
            Event::node_end(
                "generate",
                serde_json::json!({
                    "documents_count": metadata.documents_included,
                    "retries": retries,
                }),
            ),
        )
        .await?;

        // 成功路径才提交历史；持久化失败降级为警告，不吞掉已生成的回答
        if let Err(e) = self
            .sessions
            .commit_exchange(
                &mut state,
                &masked_query,
                &generation.answer,
                retries,
                language,
                Some(metadata.clone()),
            )
            .await
        {
            error!(thread_id = %thread_id, error = %e, "session persistence failed");
            metadata.warnings.push("session_persist_failed".to_string());
            self.emit_warning(sink, cancel, "session_persist_failed").await?;
        }

        let sources: Vec<SourceDocument> = selected_documents
            .iter()
            .map(SourceDocument::from_document)
            .collect();

        let response = QueryResponse {
            answer: generation.answer,
            sources,
            query: current_query,
            retries,
            thread_id: thread_id.clone(),
            context_metadata: Some(metadata),
        };

        self.emit(
            sink,
            cancel,
            Event::generation(serde_json::json!({
                "answer": response.answer,
                "sources": response.sources,
                "query": response.query,
                "retries": response.retries,
                "thread_id": response.thread_id,
                "context_metadata": response.context_metadata,
            })),
        )
        .await?;

        Ok(response)
    }

    /// 问候/致谢的定型应答：不检索、不调用 LLM
    async fn answer_canned(
        &self,
        intent: Intent,
        thread_id: &str,
        masked_query: &str,
        language: Language,
        sink: &EventSink,
        cancel: &CancelToken,
    ) -> Result<QueryResponse> {
        let answer = canned_response(intent, language.or_english()).to_string();

        let _guard = self.sessions.lock_thread(thread_id).await;
        self.check(cancel)?;
        let mut state = self.sessions.load_or_create(thread_id).await?;

        let metadata = ContextMetadata {
            model_name: self.chat.model_name().to_string(),
            validation_passed: true,
            confidence_score: 1.0,
            ..Default::default()
        };

        if let Err(e) = self
            .sessions
            .commit_exchange(&mut state, masked_query, &answer, 0, language, Some(metadata.clone()))
            .await
        {
            warn!(thread_id = %thread_id, error = %e, "session persistence failed");
        }

        let response = QueryResponse {
            answer,
            sources: Vec::new(),
            query: masked_query.to_string(),
            retries: 0,
            thread_id: thread_id.to_string(),
            context_metadata: Some(metadata),
        };

        self.emit(
            sink,
            cancel,
            Event::generation(serde_json::json!({
                "answer": response.answer,
                "sources": response.sources,
                "query": response.query,
                "retries": 0,
                "thread_id": response.thread_id,
                "context_metadata": response.context_metadata,
            })),
        )
        .await?;

        Ok(response)
    }

    /// 非流式入口：缓冲事件，仅返回终止载荷
    pub async fn ask(&self, request: QueryRequest) -> Result<QueryResponse> {
        let (sink, mut rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = self.run(request, sink, CancelToken::new()).await;
        drain.await.ok();
        result
    }

    /// 流式入口：返回事件接收端与取消令牌，流水线在后台任务中推进
    pub fn stream(self: Arc<Self>, request: QueryRequest) -> (mpsc::Receiver<Event>, CancelToken) {
        let (sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = self.run(request, sink, token).await;
        });
        (rx, cancel)
    }
}
