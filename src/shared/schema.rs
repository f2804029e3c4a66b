diesel::table! {
    tenants (id) {
        id -> Uuid,
        name -> Text,
        timezone -> Text,
        metadata -> Jsonb,
        deleted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    brands (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        name -> Text,
        persona -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    channels (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        channel_type -> Varchar,
        display_name -> Text,
        hmac_secret -> Text,
        previous_hmac_secret -> Nullable<Text>,
        secret_rotated_at -> Nullable<Timestamptz>,
        credentials -> Jsonb,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    conversations (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        channel_id -> Uuid,
        external_sender_id -> Text,
        last_message_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    message_logs (id) {
        id -> Uuid,
        conversation_id -> Uuid,
        direction -> Varchar,
        content -> Text,
        metadata -> Jsonb,
        correlation_id -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    policy_versions (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        version -> Int4,
        status -> Varchar,
        policy -> Jsonb,
        published_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    retrieval_configs (tenant_id) {
        tenant_id -> Uuid,
        hybrid_weight -> Float4,
        min_score -> Float4,
        max_documents -> Int4,
        context_budget_tokens -> Int4,
        filters -> Jsonb,
        fallback_llm -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    knowledge_assets (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        object_key -> Text,
        title -> Text,
        checksum -> Text,
        visibility -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ingestion_jobs (id) {
        id -> Uuid,
        asset_id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        status -> Varchar,
        attempts -> Int4,
        total_chunks -> Int4,
        processed_chunks -> Int4,
        failure_reason -> Nullable<Text>,
        logs -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    automation_rules (id) {
        id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        name -> Text,
        trigger_type -> Varchar,
        trigger_event -> Nullable<Text>,
        schedule -> Nullable<Text>,
        condition -> Nullable<Jsonb>,
        action_type -> Varchar,
        action_payload -> Jsonb,
        throttle_seconds -> Int4,
        max_retries -> Int4,
        is_active -> Bool,
        last_run_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    automation_jobs (id) {
        id -> Uuid,
        rule_id -> Uuid,
        tenant_id -> Uuid,
        brand_id -> Uuid,
        status -> Varchar,
        attempts -> Int4,
        scheduled_for -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        payload -> Jsonb,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    audit_logs (id) {
        id -> Uuid,
        tenant_id -> Nullable<Uuid>,
        actor -> Text,
        action -> Text,
        metadata -> Jsonb,
        correlation_id -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(brands -> tenants (tenant_id));
diesel::joinable!(channels -> brands (brand_id));
diesel::joinable!(message_logs -> conversations (conversation_id));
diesel::joinable!(ingestion_jobs -> knowledge_assets (asset_id));
diesel::joinable!(automation_jobs -> automation_rules (rule_id));

diesel::allow_tables_to_appear_in_same_query!(
    tenants,
    brands,
    channels,
    conversations,
    message_logs,
    policy_versions,
    retrieval_configs,
    knowledge_assets,
    ingestion_jobs,
    automation_rules,
    automation_jobs,
    audit_logs,
);
