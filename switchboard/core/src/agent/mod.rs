//! Agentic Route Support
//!
//! The agentic route differs from every other route in two ways: its history
//! is compressed before the request is assembled, and its response may ask for
//! tool executions that the tool loop carries out before a final answer.

pub mod compressor;
pub mod tool_loop;

pub use compressor::{
    history_hash, CompressionCacheEntry, CompressionConfig, CompressionStore,
    CompressionStoreError, ConversationCompressor, SummarizeError, Summarizer,
};
pub use tool_loop::{
    parse_embedded_tool_calls, requested_tool_calls, AgenticToolLoop, CapabilityExecutor,
    LoopState, NoTools, ToolCallRound, ToolError, ToolLoopConfig, ToolLoopRun, TurnSender,
    DEFAULT_FINAL_INSTRUCTION,
};
