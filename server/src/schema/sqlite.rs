diesel::table! {
    use crate::schema::enum_def::ServiceTypeMapping;
    use diesel::sql_types::{BigInt, Bool, Text};

    llm_config (id) {
        id -> BigInt,
        service_type -> ServiceTypeMapping,
        public_name -> Text,
        model_name -> Text,
        api_key -> Text,
        base_url -> Text,
        is_enabled -> Bool,
        notes -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
        available_on_general -> Bool,
        available_on_special -> Bool,
    }
}

diesel::table! {
    use crate::schema::enum_def::UsageStatusMapping;
    use diesel::sql_types::{BigInt, Integer, Nullable, Text};

    usage_record (id) {
        id -> Text,
        created_at -> BigInt,
        client_ip -> Text,
        public_name -> Text,
        config_id -> Nullable<BigInt>,
        input_tokens -> Integer,
        output_tokens -> Integer,
        total_tokens -> Integer,
        response_time_ms -> BigInt,
        status -> UsageStatusMapping,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    use crate::schema::enum_def::HealthStateMapping;
    use diesel::sql_types::{BigInt, Integer, Nullable, Text};

    health_status (config_id) {
        config_id -> BigInt,
        status -> HealthStateMapping,
        checked_at -> BigInt,
        response_time_ms -> Nullable<BigInt>,
        model_count -> Nullable<Integer>,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    auth_config (id) {
        id -> Integer,
        password_hash -> Text,
        salt -> Text,
        session_secret -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::joinable!(health_status -> llm_config (config_id));

diesel::allow_tables_to_appear_in_same_query!(llm_config, usage_record, health_status, auth_config);
