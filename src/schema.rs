// Telemetry schema - invocation ledger tables for Diesel ORM

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        version -> Text,
        name -> Text,
        features -> Text,
        introduced_at -> Text,
    }
}

diesel::table! {
    invocations (id) {
        id -> Text,
        timestamp -> Text,
        date -> Text,
        agent -> Text,
        tool -> Text,
        model -> Text,
        task_type -> Nullable<Text>,
        input_tokens -> BigInt,
        output_tokens -> BigInt,
        total_tokens -> BigInt,
        cost_usd -> Double,
        latency_ms -> BigInt,
        status -> Text,
        error -> Nullable<Text>,
        privacy_level -> Text,
        prompt_digest -> Nullable<Text>,
        prompt_preview -> Nullable<Text>,
        fallback_used -> Bool,
    }
}

diesel::table! {
    daily_costs (date, agent, tool, model) {
        date -> Text,
        agent -> Text,
        tool -> Text,
        model -> Text,
        invocations -> BigInt,
        total_tokens -> BigInt,
        total_cost_usd -> Double,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    schema_versions,
    invocations,
    daily_costs,
);
