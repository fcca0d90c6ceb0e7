use diesel::prelude::*;
use diesel::result::QueryResult;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use inventory_service::models::*;
use inventory_service::schema::*;

pub async fn create_tenant(conn: &mut AsyncPgConnection, name: String) -> QueryResult<Tenant> {
    diesel::insert_into(tenant::table)
        .values(&NewTenant { name })
        .get_result::<Tenant>(conn)
        .await
}

pub async fn tenant_exists(conn: &mut AsyncPgConnection, tenant_id: i64) -> QueryResult<bool> {
    diesel::select(diesel::dsl::exists(tenant::table.find(tenant_id)))
        .get_result::<bool>(conn)
        .await
}

pub async fn create_product(conn: &mut AsyncPgConnection, new_product: NewProduct) -> QueryResult<Product> {
    diesel::insert_into(product::table)
        .values(&new_product)
        .get_result::<Product>(conn)
        .await
}

pub async fn stock_by_id(conn: &mut AsyncPgConnection, stock_id: i64) -> QueryResult<Option<StockRecord>> {
    stock::table
        .find(stock_id)
        .first::<StockRecord>(conn)
        .await
        .optional()
}
