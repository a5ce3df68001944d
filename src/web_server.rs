use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::ServerConfig;
use crate::language::LanguageRegistry;
use crate::queue::SubmissionQueue;
use crate::routes::{
    get_submission_handler, json_error_handler, post_submission_handler, wake_handler,
};
use crate::worker::WakeSignal;

pub fn build_server<Q: SubmissionQueue>(
    server_config: ServerConfig,
    db_pool: SqlitePool,
    queue: Arc<Q>,
    languages: Arc<LanguageRegistry>,
    wake: Arc<WakeSignal>,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let queue = web::Data::from(queue);
    let languages = web::Data::from(languages);
    let wake = web::Data::from(wake);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(languages.clone())
            .app_data(wake.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(
                web::resource("/submissions").route(web::post().to(post_submission_handler::<Q>)),
            )
            .service(web::resource("/submissions/{id}").route(web::get().to(get_submission_handler)))
            .service(web::resource("/internal/wake").route(web::post().to(wake_handler)))
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
