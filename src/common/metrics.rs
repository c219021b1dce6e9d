use metrics::counter;

/// Error/Reliability Metrics - Success/Failure pairs
pub fn increment_dropbox_api_success() {
    counter!("dropbox_api_total", "result" => "success").increment(1);
}

pub fn increment_dropbox_api_failure() {
    counter!("dropbox_api_total", "result" => "failure").increment(1);
}

pub fn increment_garmin_api_success() {
    counter!("garmin_api_total", "result" => "success").increment(1);
}

pub fn increment_garmin_api_failure() {
    counter!("garmin_api_total", "result" => "failure").increment(1);
}

/// Per-file outcome of a sync run
pub fn increment_files_uploaded() {
    counter!("files_total", "outcome" => "uploaded").increment(1);
}

pub fn increment_files_duplicate() {
    counter!("files_total", "outcome" => "duplicate").increment(1);
}

pub fn increment_files_download_failed() {
    counter!("files_total", "outcome" => "download_failed").increment(1);
}

pub fn increment_files_upload_failed() {
    counter!("files_total", "outcome" => "upload_failed").increment(1);
}

pub fn increment_files_post_process_failed() {
    counter!("files_total", "outcome" => "post_process_failed").increment(1);
}
