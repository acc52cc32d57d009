/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

// Column types are limited to those both PostgreSQL and SQLite support.

diesel::table! {
    rule_definitions (rule_id) {
        rule_id -> Text,
        table_name -> Text,
        metric_name -> Text,
        aggregation -> Text,
        granularity -> Text,
        schedule_name -> Text,
        filter_predicate -> Nullable<Text>,
        entity_column -> Nullable<Text>,
        timestamp_column -> Nullable<Text>,
        lower_limit -> Nullable<Double>,
        upper_limit -> Nullable<Double>,
        enabled -> Bool,
        updated_at -> Text,
    }
}

diesel::table! {
    job_executions (job_id) {
        job_id -> Text,
        rule_id -> Text,
        table_name -> Text,
        metric_name -> Text,
        scheduled_for -> Text,
        status -> Text,
        attempt_count -> Integer,
        generated_sql_query -> Text,
        record_count -> Nullable<BigInt>,
        error_message -> Nullable<Text>,
        worker_id -> Nullable<Text>,
        created_at -> Text,
        started_at -> Nullable<Text>,
        finished_at -> Nullable<Text>,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(rule_definitions, job_executions);
