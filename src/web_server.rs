use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use crate::routes::{
    delete_job_handler, get_job_by_id_handler, get_jobs_handler, get_scan_handler,
    get_stats_handler, json_error_handler, post_scan_handler, post_upload_handler,
    post_vm_scan_handler, query_error_handler,
};

pub fn build_server(
    server_config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
) -> std::io::Result<Server> {
    let orchestrator = web::Data::from(orchestrator);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(orchestrator.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_upload_handler)
            .service(post_vm_scan_handler)
            .service(get_job_by_id_handler)
            .service(get_jobs_handler)
            .service(delete_job_handler)
            .service(post_scan_handler)
            .service(get_scan_handler)
            .service(get_stats_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(8080),
    ))?
    .workers(5)
    .run();

    Ok(server)
}
