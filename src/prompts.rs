//! Prompt templates sent to the language model.

/// Number of alternative phrasings requested for fusion retrieval.
pub const EXPANSION_COUNT: usize = 3;

/// Marker the reranker answers with when a passage has nothing relevant.
pub const NO_OUTPUT: &str = "NO_OUTPUT";

pub fn chunk_context(document: &str, chunk: &str) -> String {
    format!(
        "<document>\n{document}\n</document>\n\
         Here is the chunk we want to situate within the whole document\n\
         <chunk>\n{chunk}\n</chunk>\n\
         Please give a short succinct context to situate this chunk within the overall \
         document for the purposes of improving search retrieval of the chunk. \
         Answer only with the succinct context and nothing else. \
         Write the context in the same language as the document."
    )
}

pub fn query_expansion(query: &str, count: usize) -> String {
    let example: Vec<String> = (1..=count)
        .map(|i| format!("{}. alternative query {}", i, i))
        .collect();
    format!(
        "You are a search query expansion assistant. Generate different queries that \
         express the same intent as the original query using different words and phrasing.\n\n\
         Original query: {query}\n\n\
         Write {count} alternative queries, one per line, in this format:\n{}\n\n\
         Return only the queries, without any explanation.",
        example.join("\n")
    )
}

/// Extraction prompt used by the reranking pass.
pub fn extract_relevant(question: &str, passage: &str) -> String {
    format!(
        "Given the following question and context, extract any part of the context \
         *AS IS* that is relevant to answer the question. If none of the context is \
         relevant return {NO_OUTPUT}.\n\n\
         Remember, *DO NOT* edit the extracted parts of the context.\n\n\
         > Question: {question}\n\
         > Context:\n>>>\n{passage}\n>>>\n\
         Extracted relevant parts:"
    )
}

pub fn standard_answer(context: &str, question: &str) -> String {
    format!(
        "System: You are a question answering assistant. Answer the user's question using \
         only the context below. If the context does not contain the answer, say that you \
         do not know instead of making one up.\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Answer requirements:\n\
         1. Answer directly without repeating the question\n\
         2. Combine the relevant pieces when several documents apply\n\
         3. Be concise but include every relevant detail\n\
         4. Use bullet points or numbered lists where they help\n\
         5. Cite the specific documents you used\n\n\
         Answer:"
    )
}

pub fn chain_of_thought_answer(context: &str, question: &str) -> String {
    format!(
        "System: You are a question answering assistant. Answer the user's question using \
         only the context below. If the context does not contain the answer, say that you \
         do not know instead of making one up.\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Reasoning steps:\n\
         1. Work out which information the question needs\n\
         2. Find that information in the context\n\
         3. Organize it into a coherent answer\n\
         4. Check that the answer fully addresses the question\n\n\
         Think step by step first, then give the final answer.\n\n\
         Reasoning:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_prompt_lists_requested_count() {
        let prompt = query_expansion("what is bm25", 3);
        assert!(prompt.contains("Original query: what is bm25"));
        assert!(prompt.contains("3. alternative query 3"));
        assert!(!prompt.contains("4. alternative"));
    }

    #[test]
    fn test_templates_embed_inputs() {
        assert!(chunk_context("DOC", "CHUNK").contains("<chunk>\nCHUNK\n</chunk>"));
        assert!(extract_relevant("Q?", "P").contains(NO_OUTPUT));
        assert!(standard_answer("CTX", "Q?").contains("Context:\nCTX"));
        assert!(chain_of_thought_answer("CTX", "Q?").ends_with("Reasoning:"));
    }
}
