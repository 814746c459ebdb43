use crate::model::{ProductId, SaleLine};

/// The sale being put together at the counter, in the order products were first added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cart {
    lines: Vec<SaleLine>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_one(&mut self, product: &ProductId) {
        match self.lines.iter_mut().find(|line| line.product_id == *product) {
            Some(line) => line.qty += 1,
            None => self.lines.push(SaleLine {
                product_id: product.clone(),
                qty: 1,
            }),
        }
    }

    /// Takes one unit off; a line that reaches zero disappears.
    pub fn dec_one(&mut self, product: &ProductId) {
        let Some(pos) = self.lines.iter().position(|line| line.product_id == *product) else {
            return;
        };
        if self.lines[pos].qty <= 1 {
            self.lines.remove(pos);
        } else {
            self.lines[pos].qty -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[SaleLine] {
        &self.lines
    }

    pub fn qty(&self, product: &ProductId) -> u32 {
        self.lines
            .iter()
            .find(|line| line.product_id == *product)
            .map_or(0, |line| line.qty)
    }

    pub fn total_items(&self) -> u32 {
        self.lines.iter().map(|line| line.qty).sum()
    }

    /// Unknown prices count as zero.
    pub fn total_cents(&self, price_of: impl Fn(&ProductId) -> Option<i64>) -> i64 {
        self.lines
            .iter()
            .map(|line| price_of(&line.product_id).unwrap_or(0) * i64::from(line.qty))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_support::product;

    #[test]
    fn lines_keep_first_added_order() {
        let mut cart = Cart::new();
        cart.add_one(&product("water"));
        cart.add_one(&product("beer"));
        cart.add_one(&product("water"));

        assert_eq!(
            cart.lines(),
            &[SaleLine::new("water", 2), SaleLine::new("beer", 1)]
        );
        assert_eq!(cart.total_items(), 3);
    }

    #[test]
    fn taking_the_last_unit_removes_the_line() {
        let mut cart = Cart::new();
        cart.add_one(&product("beer"));
        cart.add_one(&product("beer"));

        cart.dec_one(&product("beer"));
        assert_eq!(cart.qty(&product("beer")), 1);
        cart.dec_one(&product("beer"));
        cart.dec_one(&product("cola"));

        assert!(cart.is_empty());
    }

    #[test]
    fn totals_use_the_price_list() {
        let mut cart = Cart::new();
        cart.add_one(&product("beer"));
        cart.add_one(&product("beer"));
        cart.add_one(&product("mystery"));

        let total = cart.total_cents(|product| (product.as_str() == "beer").then_some(350));

        assert_eq!(total, 700);
    }
}
