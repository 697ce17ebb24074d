diesel::table! {
    users (id) {
        id -> BigInt,
        username -> Text,
        email -> Text,
        password_hash -> Text,
        avatar -> Text,
        role -> Integer,
        microsoft_id -> Nullable<Text>,
        microsoft_name -> Nullable<Text>,
        microsoft_avatar_url -> Nullable<Text>,
        microsoft_avatar_hash -> Nullable<Text>,
        banned -> Bool,
        ban_reason -> Nullable<Text>,
        banned_at -> Nullable<Timestamp>,
        banned_by -> Nullable<BigInt>,
        unban_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    one_shot_tokens (token) {
        token -> Text,
        email -> Text,
        intent -> Integer,
        code -> Nullable<Text>,
        used -> Bool,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    verification_codes (id) {
        id -> BigInt,
        email -> Text,
        code -> Text,
        intent -> Integer,
        attempts -> Integer,
        verified -> Bool,
        verified_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    qr_login_tokens (token) {
        token -> Text,
        status -> Integer,
        user_id -> Nullable<BigInt>,
        session_token -> Nullable<Text>,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    oauth_clients (client_id) {
        client_id -> Text,
        secret_hash -> Text,
        name -> Text,
        description -> Text,
        redirect_uri -> Text,
        enabled -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    oauth_auth_codes (code) {
        code -> Text,
        client_id -> Text,
        user_id -> BigInt,
        redirect_uri -> Text,
        scope -> Text,
        used -> Bool,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    oauth_access_tokens (token_hash) {
        token_hash -> Text,
        client_id -> Text,
        user_id -> BigInt,
        scope -> Text,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    oauth_refresh_tokens (token_hash) {
        token_hash -> Text,
        access_token_hash -> Nullable<Text>,
        client_id -> Text,
        user_id -> BigInt,
        scope -> Text,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    oauth_grants (user_id, client_id) {
        user_id -> BigInt,
        client_id -> Text,
        scope -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    admin_logs (id) {
        id -> BigInt,
        admin_id -> BigInt,
        action -> Text,
        target_id -> Nullable<BigInt>,
        details -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    user_logs (id) {
        id -> BigInt,
        user_id -> BigInt,
        action -> Text,
        details -> Text,
        created_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    one_shot_tokens,
    verification_codes,
    qr_login_tokens,
    oauth_clients,
    oauth_auth_codes,
    oauth_access_tokens,
    oauth_refresh_tokens,
    oauth_grants,
    admin_logs,
    user_logs,
);
